//! Partitioned virtual memory.
//!
//! Memory holds one address→container table per partition, the LIFO operand
//! stack used by the call protocol, and the single result slot of a run.
//! Addresses are assigned once by the assembler and are never reused with a
//! different meaning at runtime; the assembler, not the processor, guarantees
//! that every address an instruction reads has been registered.

pub mod container;

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use vireo_core::{EngineError, ErrorKind};

use crate::assembler::ObjectCode;
pub use container::{Buffer, ValueContainer, ValueData};

/// A shared handle to one value container slot.
pub type ContainerRef = Rc<RefCell<ValueContainer>>;

/// Wraps a container into a sharable slot handle.
pub fn container_ref(container: ValueContainer) -> ContainerRef {
    Rc::new(RefCell::new(container))
}

/// The address partitions of virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Partition {
    /// Scratch temporaries of the processor.
    Register,
    /// Callee-local variables.
    Local,
    /// Script-global variables, bound from the host.
    Global,
    /// Immediate values and the constant pool; write-once.
    Constant,
    /// Placeholder partition of unused operand slots; a single shared empty
    /// container that no instruction ever writes.
    None,
}

impl Partition {
    /// One-letter prefix used in dumps (`R0`, `L3`, `G1`, `C7`, `-`).
    pub fn prefix(&self) -> char {
        match self {
            Partition::Register => 'R',
            Partition::Local => 'L',
            Partition::Global => 'G',
            Partition::Constant => 'C',
            Partition::None => '-',
        }
    }
}

/// The virtual memory of one run.
#[derive(Debug)]
pub struct Memory {
    registers: Vec<ContainerRef>,
    locals: Vec<ContainerRef>,
    globals: Vec<ContainerRef>,
    constants: Vec<ContainerRef>,
    stack: Vec<ContainerRef>,
    result: Option<ContainerRef>,
    /// The single shared placeholder container of the NONE partition.
    none: ContainerRef,
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            registers: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            constants: Vec::new(),
            stack: Vec::new(),
            result: None,
            none: container_ref(ValueContainer::new()),
        }
    }

    /// Sizes the partitions for executing the given object code: fresh empty
    /// containers for every REGISTER and LOCAL address the code uses, the
    /// assembled constant pool, and the host-supplied global containers in
    /// address order.
    pub fn allocate(&mut self, code: &ObjectCode, globals: Vec<ContainerRef>) {
        self.registers = (0..code.register_count())
            .map(|_| container_ref(ValueContainer::new()))
            .collect();
        self.locals = (0..code.local_count())
            .map(|_| container_ref(ValueContainer::new()))
            .collect();
        self.constants = code
            .constants()
            .iter()
            .map(|c| container_ref(c.clone()))
            .collect();
        self.globals = globals;
    }

    fn table(&self, partition: Partition) -> Result<&Vec<ContainerRef>, EngineError> {
        match partition {
            Partition::Register => Ok(&self.registers),
            Partition::Local => Ok(&self.locals),
            Partition::Global => Ok(&self.globals),
            Partition::Constant => Ok(&self.constants),
            Partition::None => Err(ErrorKind::AddressOutOfBounds {
                partition: partition.to_string(),
                address: 0,
            }
            .into()),
        }
    }

    fn table_mut(&mut self, partition: Partition) -> Result<&mut Vec<ContainerRef>, EngineError> {
        match partition {
            Partition::Register => Ok(&mut self.registers),
            Partition::Local => Ok(&mut self.locals),
            Partition::Global => Ok(&mut self.globals),
            Partition::Constant => Ok(&mut self.constants),
            Partition::None => Err(ErrorKind::AddressOutOfBounds {
                partition: partition.to_string(),
                address: 0,
            }
            .into()),
        }
    }

    /// The number of storable containers of a partition.
    pub fn partition_size(&self, partition: Partition) -> usize {
        match partition {
            Partition::None => 1,
            _ => self.table(partition).map(|t| t.len()).unwrap_or(0),
        }
    }

    /// Gets the container slot at an address. The NONE partition always
    /// yields the same shared empty placeholder container.
    pub fn get(&self, partition: Partition, address: usize) -> Result<ContainerRef, EngineError> {
        if partition == Partition::None {
            return Ok(Rc::clone(&self.none));
        }
        self.table(partition)?
            .get(address)
            .map(Rc::clone)
            .ok_or_else(|| {
                ErrorKind::AddressOutOfBounds {
                    partition: partition.to_string(),
                    address,
                }
                .into()
            })
    }

    /// Stores a container slot at an address, growing the partition with
    /// empty containers if the address is past its current end.
    pub fn set(
        &mut self,
        partition: Partition,
        address: usize,
        container: ContainerRef,
    ) -> Result<(), EngineError> {
        let table = self.table_mut(partition)?;
        while table.len() <= address {
            table.push(container_ref(ValueContainer::new()));
        }
        table[address] = container;
        Ok(())
    }

    /// Pushes a container onto the operand stack.
    pub fn push(&mut self, container: ContainerRef) {
        self.stack.push(container);
    }

    /// Pops the top of the operand stack. Popping an empty stack is a defect
    /// of the assembled code, never a script-level condition.
    pub fn pop(&mut self) -> Result<ContainerRef, EngineError> {
        self.stack.pop().ok_or_else(|| ErrorKind::EmptyStack.into())
    }

    /// The top of the operand stack, without popping it.
    pub fn peek(&self) -> Result<ContainerRef, EngineError> {
        self.stack
            .last()
            .map(Rc::clone)
            .ok_or_else(|| ErrorKind::EmptyStack.into())
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Stores the evaluation result of the run.
    pub fn set_result(&mut self, container: ContainerRef) {
        self.result = Some(container);
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Takes the evaluation result of the run, if the executed code captured
    /// one.
    pub fn take_result(&mut self) -> Option<ContainerRef> {
        self.result.take()
    }
}
