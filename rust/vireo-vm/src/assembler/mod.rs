//! The assembler: textual intermediate code in, resolved object code out.
//!
//! Two passes. The first scans directives only: it assigns LOCAL addresses
//! sequentially, resolves global variables and functions through the
//! [`SymbolResolver`] collaborator, and records each label as the index of
//! the next non-directive line. The second builds instructions, interning
//! every immediate into the deduplicated constant pool and resolving each
//! operand token by its leading marker character.

mod literals;
mod objectcode;

use std::str::FromStr;

use vireo_core::asmwords;
use vireo_core::{EngineError, ErrorKind, ValueKind};

use crate::interconnect::SymbolResolver;
use crate::isa::{Instruction, Opcode, Operand};
use crate::memory::Partition;

pub use objectcode::ObjectCode;

use literals::{parse_immediate, tokenize};

/// Assembles intermediate assembly text into object code.
#[derive(Debug, Default)]
pub struct Assembler;

impl Assembler {
    pub fn new() -> Self {
        Assembler
    }

    /// Runs both passes over the assembly text.
    pub fn assemble(
        &self,
        assembly: &str,
        resolver: &dyn SymbolResolver,
    ) -> Result<ObjectCode, EngineError> {
        let mut code = ObjectCode::new();
        self.scan_directives(assembly, resolver, &mut code)?;
        self.build_instructions(assembly, &mut code)?;
        Ok(code)
    }

    fn scan_directives(
        &self,
        assembly: &str,
        resolver: &dyn SymbolResolver,
        code: &mut ObjectCode,
    ) -> Result<(), EngineError> {
        let mut instruction_index = 0usize;

        for (line_no, raw) in numbered_lines(assembly) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let head = words.next().unwrap_or_default();

            match head {
                asmwords::LOCAL_DIRECTIVE => {
                    let identifier = directive_operand(line, words.next(), line_no)?;
                    code.add_local(identifier);
                }
                asmwords::GLOBAL_DIRECTIVE => {
                    let identifier = directive_operand(line, words.next(), line_no)?;
                    let address = resolver
                        .global_variable_address(identifier)
                        .ok_or_else(|| undefined(identifier, line_no))?;
                    code.add_global(identifier, address);
                }
                asmwords::FUNCTION_DIRECTIVE => {
                    let identifier = directive_operand(line, words.next(), line_no)?;
                    let address = resolver
                        .global_function_address(identifier)
                        .ok_or_else(|| undefined(identifier, line_no))?;
                    code.add_function(identifier, address);
                }
                asmwords::LABEL_DIRECTIVE => {
                    let identifier = directive_operand(line, words.next(), line_no)?;
                    code.add_label(identifier, instruction_index);
                }
                _ if line.starts_with(asmwords::DIRECTIVE_PREFIX) => {
                    // Other directives (META included) carry no symbols.
                }
                _ => instruction_index += 1,
            }
        }
        Ok(())
    }

    fn build_instructions(&self, assembly: &str, code: &mut ObjectCode) -> Result<(), EngineError> {
        let mut pending_meta: Option<usize> = None;

        for (line_no, raw) in numbered_lines(assembly) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with(asmwords::DIRECTIVE_PREFIX) {
                let tokens = tokenize(line).map_err(|e| e.at(None, Some(line_no)))?;
                if tokens.first() == Some(&asmwords::META_DIRECTIVE) {
                    let text = tokens.get(1).copied().ok_or_else(|| {
                        at_line(
                            ErrorKind::MalformedInstruction {
                                detail: format!("directive needs an operand: {line}"),
                            },
                            line_no,
                        )
                    })?;
                    let literal = asmwords::immediate_of(ValueKind::Text.as_ref(), text);
                    let address = self.intern_constant(&literal, code, line_no)?;
                    pending_meta = Some(address);
                }
                continue;
            }

            let tokens = tokenize(line).map_err(|e| e.at(None, Some(line_no)))?;
            let instruction = self.build_instruction(&tokens, &mut pending_meta, code, line_no)?;
            code.push_instruction(instruction);
        }
        Ok(())
    }

    fn build_instruction(
        &self,
        tokens: &[&str],
        pending_meta: &mut Option<usize>,
        code: &mut ObjectCode,
        line_no: u32,
    ) -> Result<Instruction, EngineError> {
        let mnemonic = tokens[0];
        let opcode = Opcode::from_str(mnemonic).map_err(|_| {
            at_line(
                ErrorKind::UnknownOpcode {
                    name: mnemonic.to_string(),
                },
                line_no,
            )
        })?;

        let tags = tokens.get(1).copied().ok_or_else(|| {
            at_line(
                ErrorKind::MalformedInstruction {
                    detail: format!("missing type tags after {mnemonic}"),
                },
                line_no,
            )
        })?;
        let mut kinds = Vec::new();
        for tag in tags.split(asmwords::VALUE_SEPARATOR) {
            let kind = ValueKind::from_str(tag).map_err(|_| {
                at_line(
                    ErrorKind::MalformedInstruction {
                        detail: format!("unknown type tag \"{tag}\""),
                    },
                    line_no,
                )
            })?;
            kinds.push(kind);
        }

        let mut operands = Vec::with_capacity(tokens.len() - 2);
        for token in &tokens[2..] {
            operands.push(self.resolve_operand(token, code, line_no)?);
        }

        let meta = pending_meta
            .take()
            .map(|address| Operand::new(Partition::Constant, address));
        Ok(Instruction::new(opcode, kinds, operands, meta))
    }

    /// Resolves one operand token by its leading marker character.
    fn resolve_operand(
        &self,
        token: &str,
        code: &mut ObjectCode,
        line_no: u32,
    ) -> Result<Operand, EngineError> {
        let marker = token.chars().next().unwrap_or_default();

        match marker {
            asmwords::IMMEDIATE_PREFIX => {
                let address = self.intern_constant(token, code, line_no)?;
                Ok(Operand::new(Partition::Constant, address))
            }
            asmwords::REGISTER_PREFIX => {
                let address = token[1..].parse::<usize>().map_err(|_| {
                    at_line(
                        ErrorKind::MalformedOperand {
                            token: token.to_string(),
                        },
                        line_no,
                    )
                })?;
                code.track_register(address);
                Ok(Operand::new(Partition::Register, address))
            }
            asmwords::IDENTIFIER_PREFIX => {
                // Locals shadow globals; both shadow function names.
                if let Some(address) = code.local_address(token) {
                    Ok(Operand::new(Partition::Local, address))
                } else if let Some(address) = code.global_address(token) {
                    Ok(Operand::new(Partition::Global, address))
                } else if let Some(entry) = code.function_address(token) {
                    // Functions are always passed as boxed constant addresses.
                    let literal =
                        asmwords::immediate_of(ValueKind::Int64.as_ref(), &entry.to_string());
                    let address = self.intern_constant(&literal, code, line_no)?;
                    Ok(Operand::new(Partition::Constant, address))
                } else {
                    Err(undefined(token, line_no))
                }
            }
            asmwords::LABEL_PREFIX => {
                let index = code
                    .label_address(token)
                    .ok_or_else(|| undefined(token, line_no))?;
                let literal = asmwords::immediate_of(ValueKind::Int64.as_ref(), &index.to_string());
                let address = self.intern_constant(&literal, code, line_no)?;
                Ok(Operand::new(Partition::Constant, address))
            }
            asmwords::PLACEHOLDER_PREFIX => Ok(Operand::placeholder()),
            _ => Err(at_line(
                ErrorKind::MalformedOperand {
                    token: token.to_string(),
                },
                line_no,
            )),
        }
    }

    /// Interns an immediate literal, returning its existing CONSTANT address
    /// when the exact literal text has been seen before.
    fn intern_constant(
        &self,
        literal: &str,
        code: &mut ObjectCode,
        line_no: u32,
    ) -> Result<usize, EngineError> {
        if let Some(address) = code.constant_address(literal) {
            return Ok(address);
        }
        let container = parse_immediate(literal).map_err(|e| e.at(None, Some(line_no)))?;
        Ok(code.add_constant(literal, container))
    }
}

fn numbered_lines(assembly: &str) -> impl Iterator<Item = (u32, &str)> {
    assembly
        .lines()
        .enumerate()
        .map(|(index, line)| (index as u32 + 1, line))
}

fn directive_operand<'a>(
    line: &str,
    word: Option<&'a str>,
    line_no: u32,
) -> Result<&'a str, EngineError> {
    word.ok_or_else(|| {
        at_line(
            ErrorKind::MalformedInstruction {
                detail: format!("directive needs an operand: {line}"),
            },
            line_no,
        )
    })
}

fn undefined(identifier: &str, line_no: u32) -> EngineError {
    at_line(
        ErrorKind::UndefinedSymbol {
            name: identifier.to_string(),
        },
        line_no,
    )
}

fn at_line(kind: ErrorKind, line_no: u32) -> EngineError {
    EngineError::new(kind).at(None, Some(line_no))
}
