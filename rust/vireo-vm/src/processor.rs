//! The processor: the fetch-dispatch-execute loop of one run.

use vireo_core::asmwords;
use vireo_core::{EngineError, ErrorKind};

use crate::dispatch::DispatchUnit;
use crate::exec::ExecutionUnit;
use crate::interconnect::ExternalCaller;
use crate::isa::Instruction;
use crate::memory::Memory;

/// The mutable state of one run, bundled and passed by reference through
/// dispatch: the virtual memory and the per-function running flags. The
/// flags table is `None` only for single-stepped execution, which runs
/// without the recursion guard.
pub struct RunContext<'m> {
    pub memory: &'m mut Memory,
    pub running_flags: Option<Vec<bool>>,
}

impl<'m> RunContext<'m> {
    /// A context for a full run: one running flag per instruction address.
    pub fn for_run(memory: &'m mut Memory, instruction_count: usize) -> Self {
        RunContext {
            memory,
            running_flags: Some(vec![false; instruction_count]),
        }
    }

    /// A context for single-stepping, without the recursion guard table.
    pub fn for_step(memory: &'m mut Memory) -> Self {
        RunContext {
            memory,
            running_flags: None,
        }
    }
}

/// Executes instruction streams.
///
/// The processor owns the program counter: starting from 0, it dispatches
/// one instruction at a time and assigns the returned value to the counter,
/// until the counter leaves the instruction range. It also forms the error
/// boundary of the core: every failure leaves here as a structured
/// [`EngineError`] with the failing instruction's source position attached —
/// the host never observes a raw, unstructured fault.
#[derive(Debug, Default)]
pub struct Processor;

impl Processor {
    pub fn new() -> Self {
        Processor
    }

    /// Runs the whole instruction stream against the given memory.
    pub fn process(
        &self,
        instructions: &[Instruction],
        memory: &mut Memory,
        external: &mut dyn ExternalCaller,
    ) -> Result<(), EngineError> {
        let execution_unit = ExecutionUnit::new();
        let dispatch_unit = DispatchUnit::new();
        let mut context = RunContext::for_run(memory, instructions.len());

        let mut pc: isize = 0;
        while 0 <= pc && (pc as usize) < instructions.len() {
            let instruction = &instructions[pc as usize];
            pc = dispatch_unit
                .dispatch(
                    instruction,
                    &mut context,
                    external,
                    &execution_unit,
                    pc as usize,
                )
                .map_err(|error| self.wrap(error, instruction, context.memory))?;
        }
        Ok(())
    }

    /// Executes exactly one instruction and returns the updated program
    /// counter. Intended for isolated or instrumented execution; runs
    /// without the recursion-guard table.
    pub fn step(
        &self,
        instruction: &Instruction,
        memory: &mut Memory,
        external: &mut dyn ExternalCaller,
        pc: usize,
    ) -> Result<isize, EngineError> {
        let execution_unit = ExecutionUnit::new();
        let dispatch_unit = DispatchUnit::new();
        let mut context = RunContext::for_step(memory);
        dispatch_unit
            .dispatch(instruction, &mut context, external, &execution_unit, pc)
            .map_err(|error| self.wrap(error, instruction, context.memory))
    }

    /// The uniform error boundary: defects become the "unexpected engine
    /// error" kind, and every error gets the failing instruction's source
    /// file/line attached when it does not already carry a location.
    fn wrap(&self, error: EngineError, instruction: &Instruction, memory: &Memory) -> EngineError {
        let (file, line) = self.meta_of(instruction, memory);
        if error.is_defect() {
            EngineError::new(ErrorKind::Unexpected {
                detail: error.kind.to_string(),
            })
            .at(file, line)
        } else {
            error.at(file, line)
        }
    }

    /// Extracts source file/line from the instruction's meta operand. The
    /// meta text is diagnostics-only, so failures to read it are ignored.
    fn meta_of(
        &self,
        instruction: &Instruction,
        memory: &Memory,
    ) -> (Option<String>, Option<u32>) {
        let Some(meta) = instruction.meta else {
            return (None, None);
        };
        let Ok(container) = memory.get(meta.partition, meta.address) else {
            return (None, None);
        };
        let Ok(text) = container.borrow().get_text_scalar() else {
            return (None, None);
        };
        (asmwords::meta_file(&text), asmwords::meta_line(&text))
    }
}
