//! The dispatch unit: one instruction in, the next program counter out.
//!
//! Loads every operand container from memory by (partition, address), then
//! routes on the opcode with a flat `match` — the intended cost model of a
//! bytecode interpreter. Straight-line opcodes return pc+1; branches, calls,
//! and returns compute their target; END returns -1 to leave the
//! instruction range and terminate the run.

use std::rc::Rc;

use vireo_core::{EngineError, ErrorKind};

use crate::exec::ExecutionUnit;
use crate::interconnect::ExternalCaller;
use crate::isa::{Instruction, Opcode};
use crate::memory::{container_ref, ContainerRef, ValueContainer};
use crate::processor::RunContext;

#[derive(Debug, Default)]
pub struct DispatchUnit;

impl DispatchUnit {
    pub fn new() -> Self {
        DispatchUnit
    }

    /// Executes one instruction and returns the next program counter.
    pub fn dispatch(
        &self,
        instruction: &Instruction,
        context: &mut RunContext<'_>,
        external: &mut dyn ExternalCaller,
        execution_unit: &ExecutionUnit,
        pc: usize,
    ) -> Result<isize, EngineError> {
        let kind = instruction.kinds.first().copied().ok_or_else(|| {
            ErrorKind::MalformedInstruction {
                detail: format!("{} instruction carries no type tag", instruction.opcode.as_ref()),
            }
        })?;
        let operands = self.load_operands(instruction, context)?;
        let next = pc as isize + 1;

        match instruction.opcode {
            // Arithmetic
            Opcode::Add => {
                self.check_arity(instruction, 3)?;
                execution_unit.add(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Sub => {
                self.check_arity(instruction, 3)?;
                execution_unit.sub(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Mul => {
                self.check_arity(instruction, 3)?;
                execution_unit.mul(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Div => {
                self.check_arity(instruction, 3)?;
                execution_unit.div(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Rem => {
                self.check_arity(instruction, 3)?;
                execution_unit.rem(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Neg => {
                self.check_arity(instruction, 2)?;
                execution_unit.neg(kind, &operands[0], &operands[1])?;
                Ok(next)
            }

            // Comparison
            Opcode::Eq => {
                self.check_arity(instruction, 3)?;
                execution_unit.eq(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Neq => {
                self.check_arity(instruction, 3)?;
                execution_unit.neq(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Geq => {
                self.check_arity(instruction, 3)?;
                execution_unit.geq(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Leq => {
                self.check_arity(instruction, 3)?;
                execution_unit.leq(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Gt => {
                self.check_arity(instruction, 3)?;
                execution_unit.gt(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Lt => {
                self.check_arity(instruction, 3)?;
                execution_unit.lt(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }

            // Logical
            Opcode::And => {
                self.check_arity(instruction, 3)?;
                execution_unit.and(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Or => {
                self.check_arity(instruction, 3)?;
                execution_unit.or(kind, &operands[0], &operands[1], &operands[2])?;
                Ok(next)
            }
            Opcode::Not => {
                self.check_arity(instruction, 2)?;
                execution_unit.not(kind, &operands[0], &operands[1])?;
                Ok(next)
            }

            // Memory management
            Opcode::Alloc => {
                self.check_min_arity(instruction, 1)?;
                if operands.len() == 1 {
                    execution_unit.alloc_scalar(kind, &operands[0])?;
                } else {
                    execution_unit.alloc_vector(kind, &operands[0], &operands[1..])?;
                }
                Ok(next)
            }
            Opcode::AllocR => {
                self.check_arity(instruction, 2)?;
                execution_unit.alloc_same_lengths(kind, &operands[0], &operands[1])?;
                Ok(next)
            }
            Opcode::AllocP => {
                self.check_arity(instruction, 1)?;
                let top = context.memory.peek()?;
                execution_unit.alloc_same_lengths(kind, &operands[0], &top)?;
                Ok(next)
            }
            Opcode::Free => {
                self.check_arity(instruction, 1)?;
                operands[0].borrow_mut().initialize();
                Ok(next)
            }

            // Transfer
            Opcode::Mov => {
                self.check_arity(instruction, 2)?;
                execution_unit.mov(kind, &operands[0], &operands[1])?;
                Ok(next)
            }
            Opcode::Ref => {
                self.check_arity(instruction, 2)?;
                execution_unit.ref_assign(kind, &operands[0], &operands[1])?;
                Ok(next)
            }
            Opcode::Pop => {
                self.check_arity(instruction, 1)?;
                context.memory.pop()?;
                Ok(next)
            }
            Opcode::MovPop => {
                self.check_arity(instruction, 1)?;
                let source = context.memory.pop()?;
                execution_unit.mov(kind, &operands[0], &source)?;
                Ok(next)
            }
            Opcode::RefPop => {
                self.check_arity(instruction, 1)?;
                let source = context.memory.pop()?;
                execution_unit.ref_assign(kind, &operands[0], &source)?;
                Ok(next)
            }
            Opcode::Cast => {
                self.check_arity(instruction, 2)?;
                let source_kind = instruction.kinds.get(1).copied().ok_or_else(|| {
                    ErrorKind::MalformedInstruction {
                        detail: "CAST needs a destination and a source type tag".to_string(),
                    }
                })?;
                execution_unit.cast(kind, source_kind, &operands[0], &operands[1])?;
                Ok(next)
            }
            Opcode::Fill => {
                self.check_arity(instruction, 2)?;
                execution_unit.fill(kind, &operands[0], &operands[1])?;
                Ok(next)
            }
            Opcode::MovElm => {
                self.check_min_arity(instruction, 3)?;
                execution_unit.movelm(kind, &operands[0], &operands[1], &operands[2..])?;
                Ok(next)
            }
            Opcode::RefElm => {
                self.check_min_arity(instruction, 3)?;
                execution_unit.refelm(kind, &operands[0], &operands[1], &operands[2..])?;
                Ok(next)
            }

            // Control
            Opcode::Jmp => {
                // operands: placeholder, target address, condition.
                self.check_arity(instruction, 3)?;
                // A multi-element condition jumps only when every element is
                // true, matching vector-level short-circuit evaluation.
                if self.condition_all_true(&operands[2])? {
                    self.jump_target(&operands[1])
                } else {
                    Ok(next)
                }
            }
            Opcode::Jmpn => {
                self.check_arity(instruction, 3)?;
                // The dual: jump only when every element is false.
                if self.condition_any_true(&operands[2])? {
                    Ok(next)
                } else {
                    self.jump_target(&operands[1])
                }
            }

            Opcode::Call => {
                // operands: placeholder, entry address, arguments...
                self.check_min_arity(instruction, 2)?;

                // The callee returns to the instruction after this one.
                let return_address = pc as i64 + 1;
                context
                    .memory
                    .push(container_ref(ValueContainer::int64_scalar(return_address)));
                for argument in &operands[2..] {
                    context.memory.push(Rc::clone(argument));
                }

                let entry = operands[1].borrow().get_int64_scalar()?;
                let entry_index = usize::try_from(entry)
                    .map_err(|_| ErrorKind::InvalidFunctionAddress { address: entry })?;
                if let Some(flags) = context.running_flags.as_mut() {
                    let flag = flags
                        .get_mut(entry_index)
                        .ok_or(ErrorKind::InvalidFunctionAddress { address: entry })?;
                    if *flag {
                        return Err(ErrorKind::RecursiveCall { entry: entry_index }.into());
                    }
                    *flag = true;
                }
                Ok(entry_index as isize)
            }

            Opcode::Ret => {
                // operands: placeholder, entry address, optional return value.
                self.check_min_arity(instruction, 2)?;

                let return_container = context.memory.pop()?;
                let return_address = return_container.borrow().get_int64_scalar()?;

                // Keep the stack shape uniform whether or not a value is
                // returned: push an empty placeholder when there is none.
                if operands.len() <= 2 {
                    context.memory.push(container_ref(ValueContainer::new()));
                } else {
                    context.memory.push(Rc::clone(&operands[2]));
                }

                let entry = operands[1].borrow().get_int64_scalar()?;
                if let Some(flags) = context.running_flags.as_mut() {
                    let entry_index = usize::try_from(entry)
                        .map_err(|_| ErrorKind::InvalidFunctionAddress { address: entry })?;
                    let flag = flags
                        .get_mut(entry_index)
                        .ok_or(ErrorKind::InvalidFunctionAddress { address: entry })?;
                    *flag = false;
                }
                Ok(return_address as isize)
            }

            Opcode::CallX => {
                // operands: return target, external function index, arguments...
                self.check_min_arity(instruction, 2)?;
                let index = operands[1].borrow().get_int64_scalar()?;
                let index = usize::try_from(index).map_err(|_| ErrorKind::ExternalCall {
                    message: format!("invalid external function index {index}"),
                })?;
                external.invoke(index, &operands[2..], &operands[0])?;
                Ok(next)
            }

            Opcode::EndFun => {
                self.check_arity(instruction, 1)?;
                let name = operands[0].borrow().get_text_scalar()?;
                Err(ErrorKind::FunctionEndedWithoutReturn { name }.into())
            }

            Opcode::End => {
                // operands: placeholder, optional result value.
                self.check_min_arity(instruction, 1)?;
                if operands.len() == 2 {
                    // The operand's container is released with this run's
                    // memory, so the result slot gets a copy, never an alias.
                    let result = container_ref(ValueContainer::new());
                    execution_unit.alloc_same_lengths(kind, &result, &operands[1])?;
                    execution_unit.mov(kind, &result, &operands[1])?;
                    context.memory.set_result(result);
                }
                Ok(-1)
            }

            Opcode::Nop => Ok(next),
        }
    }

    fn load_operands(
        &self,
        instruction: &Instruction,
        context: &mut RunContext<'_>,
    ) -> Result<Vec<ContainerRef>, EngineError> {
        instruction
            .operands
            .iter()
            .map(|operand| context.memory.get(operand.partition, operand.address))
            .collect()
    }

    fn check_arity(&self, instruction: &Instruction, expected: usize) -> Result<(), EngineError> {
        if instruction.operand_count() != expected {
            return Err(ErrorKind::OperandCountMismatch {
                opcode: instruction.opcode.as_ref().to_string(),
                expected,
                actual: instruction.operand_count(),
            }
            .into());
        }
        Ok(())
    }

    fn check_min_arity(&self, instruction: &Instruction, minimum: usize) -> Result<(), EngineError> {
        if instruction.operand_count() < minimum {
            return Err(ErrorKind::OperandCountMismatch {
                opcode: instruction.opcode.as_ref().to_string(),
                expected: minimum,
                actual: instruction.operand_count(),
            }
            .into());
        }
        Ok(())
    }

    fn condition_all_true(&self, condition: &ContainerRef) -> Result<bool, EngineError> {
        let condition = condition.borrow();
        let buffer = condition.bool_buffer()?;
        condition.check_window(condition.size())?;
        let values = buffer.borrow();
        let offset = condition.offset();
        Ok(values[offset..offset + condition.size()].iter().all(|&v| v))
    }

    fn condition_any_true(&self, condition: &ContainerRef) -> Result<bool, EngineError> {
        let condition = condition.borrow();
        let buffer = condition.bool_buffer()?;
        condition.check_window(condition.size())?;
        let values = buffer.borrow();
        let offset = condition.offset();
        Ok(values[offset..offset + condition.size()].iter().any(|&v| v))
    }

    fn jump_target(&self, target: &ContainerRef) -> Result<isize, EngineError> {
        let address = target.borrow().get_int64_scalar()?;
        Ok(address as isize)
    }
}
