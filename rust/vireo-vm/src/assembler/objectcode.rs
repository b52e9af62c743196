//! The resolved output of the assembler.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::isa::Instruction;
use crate::memory::ValueContainer;

/// The executable form of one assembled program: the instruction array, the
/// materialized constant pool, and the symbol tables in both directions.
/// The reverse tables exist for dumps and diagnostics, not for execution.
#[derive(Debug, Default)]
pub struct ObjectCode {
    instructions: Vec<Instruction>,
    constants: Vec<ValueContainer>,
    constant_texts: Vec<String>,
    constant_addresses: HashMap<String, usize>,
    local_addresses: HashMap<String, usize>,
    global_addresses: HashMap<String, usize>,
    function_addresses: HashMap<String, usize>,
    label_addresses: HashMap<String, usize>,
    local_names: HashMap<usize, String>,
    global_names: HashMap<usize, String>,
    function_names: HashMap<usize, String>,
    label_names: HashMap<usize, String>,
    max_register_address: Option<usize>,
}

impl ObjectCode {
    pub fn new() -> Self {
        ObjectCode::default()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub(crate) fn push_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn constants(&self) -> &[ValueContainer] {
        &self.constants
    }

    /// Number of REGISTER-partition slots the program needs.
    pub fn register_count(&self) -> usize {
        self.max_register_address.map_or(0, |max| max + 1)
    }

    pub(crate) fn track_register(&mut self, address: usize) {
        let max = self.max_register_address.get_or_insert(address);
        if address > *max {
            *max = address;
        }
    }

    /// Number of LOCAL-partition slots the program needs.
    pub fn local_count(&self) -> usize {
        self.local_addresses.len()
    }

    pub(crate) fn add_local(&mut self, identifier: &str) -> usize {
        let address = self.local_addresses.len();
        self.local_addresses.insert(identifier.to_string(), address);
        self.local_names.insert(address, identifier.to_string());
        address
    }

    pub(crate) fn add_global(&mut self, identifier: &str, address: usize) {
        self.global_addresses.insert(identifier.to_string(), address);
        self.global_names.insert(address, identifier.to_string());
    }

    pub(crate) fn add_function(&mut self, identifier: &str, address: usize) {
        self.function_addresses
            .insert(identifier.to_string(), address);
        self.function_names.insert(address, identifier.to_string());
    }

    pub(crate) fn add_label(&mut self, identifier: &str, instruction_index: usize) {
        self.label_addresses
            .insert(identifier.to_string(), instruction_index);
        self.label_names
            .insert(instruction_index, identifier.to_string());
    }

    pub(crate) fn add_constant(&mut self, literal: &str, container: ValueContainer) -> usize {
        let address = self.constants.len();
        self.constants.push(container);
        self.constant_texts.push(literal.to_string());
        self.constant_addresses.insert(literal.to_string(), address);
        address
    }

    pub fn constant_address(&self, literal: &str) -> Option<usize> {
        self.constant_addresses.get(literal).copied()
    }

    pub fn local_address(&self, identifier: &str) -> Option<usize> {
        self.local_addresses.get(identifier).copied()
    }

    pub fn global_address(&self, identifier: &str) -> Option<usize> {
        self.global_addresses.get(identifier).copied()
    }

    pub fn function_address(&self, identifier: &str) -> Option<usize> {
        self.function_addresses.get(identifier).copied()
    }

    pub fn label_address(&self, identifier: &str) -> Option<usize> {
        self.label_addresses.get(identifier).copied()
    }

    pub fn local_name(&self, address: usize) -> Option<&str> {
        self.local_names.get(&address).map(String::as_str)
    }

    pub fn global_name(&self, address: usize) -> Option<&str> {
        self.global_names.get(&address).map(String::as_str)
    }

    pub fn function_name(&self, address: usize) -> Option<&str> {
        self.function_names.get(&address).map(String::as_str)
    }

    pub fn label_name(&self, instruction_index: usize) -> Option<&str> {
        self.label_names.get(&instruction_index).map(String::as_str)
    }

    /// Renders the object code as readable text, for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "#INSTRUCTIONS");
        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Some(label) = self.label_name(index) {
                let _ = writeln!(out, "({label})");
            }
            let _ = writeln!(out, "{index}\t{instruction}");
        }
        let _ = writeln!(out, "#CONSTANTS");
        for (address, text) in self.constant_texts.iter().enumerate() {
            let _ = writeln!(out, "C{address}\t{text}");
        }
        let _ = writeln!(out, "#SYMBOLS");
        let mut locals: Vec<_> = self.local_addresses.iter().collect();
        locals.sort_by_key(|(_, address)| **address);
        for (name, address) in locals {
            let _ = writeln!(out, "L{address}\t{name}");
        }
        let mut globals: Vec<_> = self.global_addresses.iter().collect();
        globals.sort_by_key(|(_, address)| **address);
        for (name, address) in globals {
            let _ = writeln!(out, "G{address}\t{name}");
        }
        let mut functions: Vec<_> = self.function_addresses.iter().collect();
        functions.sort_by_key(|(_, address)| **address);
        for (name, address) in functions {
            let _ = writeln!(out, "F{address}\t{name}");
        }
        out
    }
}
