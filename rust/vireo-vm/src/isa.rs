//! The instruction set of the virtual processor.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use vireo_core::ValueKind;

use crate::memory::Partition;

/// Operation codes. The mnemonic spelling in assembly text is the uppercase
/// variant name (`ALLOCR`, `MOVPOP`, `CALLX`, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Opcode {
    // Arithmetic
    Add, // out, a, b: out = a + b (also text concatenation)
    Sub, // out, a, b: out = a - b
    Mul, // out, a, b: out = a * b
    Div, // out, a, b: out = a / b
    Rem, // out, a, b: out = a % b
    Neg, // out, a:    out = -a

    // Comparison (out is always bool)
    Eq,  // out, a, b: out = (a == b)
    Neq, // out, a, b: out = (a != b)
    Geq, // out, a, b: out = (a >= b)
    Leq, // out, a, b: out = (a <= b)
    Gt,  // out, a, b: out = (a > b)
    Lt,  // out, a, b: out = (a < b)

    // Logical (bool only; AND/OR short-circuit at the vector level)
    And, // out, a, b: out = a && b
    Or,  // out, a, b: out = a || b
    Not, // out, a:    out = !a

    // Memory management
    Alloc,  // target [, len...]: scalar alloc, or array alloc with one length operand per dimension
    AllocR, // target, ref: alloc with the same rank/lengths as ref
    AllocP, // target: alloc with the same rank/lengths as the top of the stack
    Free,   // target: release the buffer, back to the empty state

    // Transfer
    Mov,    // dest, src: value copy (element counts must match)
    Ref,    // dest, src: reference-assign (dest aliases src's buffer)
    Pop,    // -: discard the top of the stack
    MovPop, // dest: pop the stack and value-copy into dest
    RefPop, // dest: pop the stack and reference-assign into dest
    Cast,   // dest, src: convert src's kind to dest's kind (two type tags)
    Fill,   // dest, src: broadcast the scalar src into every element of dest
    MovElm, // dest, src, idx...: dest = src[idx...] (value copy)
    RefElm, // dest, src, idx...: dest aliases the element src[idx...]

    // Control
    Jmp,    // -, target, cond: jump when every element of cond is true
    Jmpn,   // -, target, cond: jump when every element of cond is false
    Call,   // -, fn, arg...: push return address and args, jump to fn
    Ret,    // -, fn [, value]: pop return address, push value, jump back
    CallX,  // ret, index, arg...: synchronous external function call
    EndFun, // name: fell off the end of a value-returning function
    End,    // - [, value]: terminate the run, optionally capturing a result
    Nop,    // no operation
}

/// One operand location: a partition and an address inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub partition: Partition,
    pub address: usize,
}

impl Operand {
    pub fn new(partition: Partition, address: usize) -> Self {
        Operand { partition, address }
    }

    /// The shared placeholder operand (NONE partition).
    pub fn placeholder() -> Self {
        Operand {
            partition: Partition::None,
            address: 0,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition == Partition::None {
            write!(f, "-")
        } else {
            write!(f, "{}{}", self.partition.prefix(), self.address)
        }
    }
}

/// One immutable instruction of the resolved program.
///
/// `kinds` holds the operand type tag(s); what they mean depends on the
/// opcode (CAST carries a destination and a source kind, everything else a
/// single kind). `meta` points at a CONSTANT text value carrying source
/// file/line for diagnostics; it is never read during normal execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub kinds: Vec<ValueKind>,
    pub operands: Vec<Operand>,
    pub meta: Option<Operand>,
}

impl Instruction {
    pub fn new(
        opcode: Opcode,
        kinds: Vec<ValueKind>,
        operands: Vec<Operand>,
        meta: Option<Operand>,
    ) -> Self {
        Instruction {
            opcode,
            kinds,
            operands,
            meta,
        }
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.as_ref())?;
        let tags: Vec<&str> = self.kinds.iter().map(|k| k.as_ref()).collect();
        write!(f, "\t{}", tags.join(":"))?;
        for operand in &self.operands {
            write!(f, "\t{operand}")?;
        }
        if let Some(meta) = &self.meta {
            write!(f, "\tmeta={meta}")?;
        }
        Ok(())
    }
}
