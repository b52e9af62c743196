//! The virtual machine facade: assemble, allocate, run, extract the result.

use vireo_core::EngineError;

use crate::assembler::{Assembler, ObjectCode};
use crate::interconnect::{ExternalCaller, SymbolResolver};
use crate::memory::{ContainerRef, Memory};
use crate::processor::Processor;

/// Wires the assembler, virtual memory, and processor together for hosts
/// that want to run intermediate assembly text end to end.
#[derive(Debug, Default)]
pub struct VirtualMachine {
    assembler: Assembler,
    processor: Processor,
}

impl VirtualMachine {
    pub fn new() -> Self {
        VirtualMachine::default()
    }

    /// Assembles without executing, for hosts that cache object code or dump
    /// it for inspection.
    pub fn assemble(
        &self,
        assembly: &str,
        resolver: &dyn SymbolResolver,
    ) -> Result<ObjectCode, EngineError> {
        self.assembler.assemble(assembly, resolver)
    }

    /// Runs assembly text to completion. `globals` supplies the containers
    /// of the GLOBAL partition in address order; they are shared with the
    /// host, so script writes through them stay visible after the run. The
    /// returned container is the run's evaluation result, when the executed
    /// code captured one.
    pub fn run(
        &self,
        assembly: &str,
        resolver: &dyn SymbolResolver,
        globals: Vec<ContainerRef>,
        external: &mut dyn ExternalCaller,
    ) -> Result<Option<ContainerRef>, EngineError> {
        let code = self.assembler.assemble(assembly, resolver)?;
        let mut memory = Memory::new();
        memory.allocate(&code, globals);
        self.processor
            .process(code.instructions(), &mut memory, external)?;
        Ok(memory.take_result())
    }
}
