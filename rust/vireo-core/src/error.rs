//! Structured engine errors.
//!
//! Failures are split into two tiers. Catchable kinds are runtime conditions
//! a script can trigger and a host can handle (cast failures, bad indices,
//! rejected recursion, and so on). Defect kinds mean the compiled input or
//! the caller violated the engine's contract; the processor converts them to
//! the uniform [`ErrorKind::Unexpected`] form at its boundary, so a host
//! never observes a raw failure of either tier.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::kinds::ValueKind;

/// Every failure kind the engine can produce.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // ---- catchable, script-level conditions ----
    /// The source value cannot be represented in the requested kind.
    #[error("the value \"{value}\" could not be converted to the {to} type")]
    CastFailedByValue { value: String, to: ValueKind },

    /// The kind pair has no defined conversion.
    #[error("conversion from the {from} type to the {to} type is not available")]
    CastFailedByType { from: ValueKind, to: ValueKind },

    /// An array subscript fell outside a dimension's declared length.
    #[error("the array index {index} is out of range (valid range: 0 to {upper})")]
    InvalidArrayIndex { index: i64, upper: i64 },

    /// An array of more than one element was assigned to a scalar variable.
    #[error("an array of {size} elements cannot be assigned to a scalar variable")]
    ArrayTooLargeForScalar { size: usize },

    /// A function was called again before its previous activation returned.
    #[error("recursive call detected at function address {entry} (recursion is not supported)")]
    RecursiveCall { entry: usize },

    /// Control flow reached the end of a function that must return a value.
    #[error("the function \"{name}\" ended without returning a value")]
    FunctionEndedWithoutReturn { name: String },

    /// The external-call collaborator reported a failure.
    #[error("external function call failed: {message}")]
    ExternalCall { message: String },

    // ---- defects: malformed compiled input or contract violations ----
    /// An instruction carried the wrong number of operands for its opcode.
    #[error("invalid number of operands for {opcode}: expected {expected}, got {actual}")]
    OperandCountMismatch {
        opcode: String,
        expected: usize,
        actual: usize,
    },

    /// An operation was dispatched with a kind it does not operate on.
    #[error("unoperatable data type: {kind}")]
    UnsupportedOperandType { kind: ValueKind },

    /// An operand container holds data of a different kind than declared.
    #[error("operand data type mismatch: expected {expected}, got {actual}")]
    OperandTypeMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },

    /// An operand container holds no data at all.
    #[error("operand data is not initialized")]
    EmptyOperand,

    /// Operand element counts that must agree do not.
    #[error("operand element counts do not match: expected {expected}, got {actual}")]
    OperandSizeMismatch { expected: usize, actual: usize },

    /// An array was allocated with a negative or overflowing length.
    #[error("invalid array length: {length}")]
    InvalidArrayLength { length: i64 },

    /// A call or return targeted an address outside the instruction stream.
    #[error("invalid function address: {address}")]
    InvalidFunctionAddress { address: i64 },

    /// A value was popped from the empty operand stack.
    #[error("the operand stack is empty")]
    EmptyStack,

    /// An operand addressed a slot outside its partition.
    #[error("address {address} is out of bounds of the {partition} partition")]
    AddressOutOfBounds { partition: String, address: usize },

    /// Integer division or remainder by zero.
    #[error("integer division by zero")]
    DivisionByZero,

    /// The mnemonic or opcode is not part of the instruction set.
    #[error("unknown operation code: {name}")]
    UnknownOpcode { name: String },

    /// An assembly identifier resolved to no local, global, or function.
    #[error("undefined identifier in operands: {name}")]
    UndefinedSymbol { name: String },

    /// An operand token carried no recognized marker character.
    #[error("unresolvable operand token: {token}")]
    MalformedOperand { token: String },

    /// An immediate literal failed validation.
    #[error("malformed immediate literal: {literal}")]
    MalformedLiteral { literal: String },

    /// An assembly line is structurally broken (missing words, bad tags).
    #[error("malformed instruction line: {detail}")]
    MalformedInstruction { detail: String },

    // ---- the uniform wrapper kind ----
    /// Produced at the processor boundary from any defect-tier failure.
    #[error("unexpected engine error: {detail}")]
    Unexpected { detail: String },
}

impl ErrorKind {
    /// Whether this kind is a contract violation rather than a script-level
    /// condition. The processor rewrites defects into [`ErrorKind::Unexpected`].
    pub fn is_defect(&self) -> bool {
        !matches!(
            self,
            ErrorKind::CastFailedByValue { .. }
                | ErrorKind::CastFailedByType { .. }
                | ErrorKind::InvalidArrayIndex { .. }
                | ErrorKind::ArrayTooLargeForScalar { .. }
                | ErrorKind::RecursiveCall { .. }
                | ErrorKind::FunctionEndedWithoutReturn { .. }
                | ErrorKind::ExternalCall { .. }
                | ErrorKind::Unexpected { .. }
        )
    }
}

/// A failure surfaced to the host: a kind plus the source position of the
/// failing instruction or assembly line, when one is known.
///
/// The `Display` form is the engine's locale-independent rendering; richer,
/// locale-aware presentation belongs to the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl EngineError {
    pub fn new(kind: ErrorKind) -> Self {
        EngineError {
            kind,
            file: None,
            line: None,
        }
    }

    /// Attaches a source position, unless one is already present.
    pub fn at(mut self, file: Option<String>, line: Option<u32>) -> Self {
        if self.file.is_none() && self.line.is_none() {
            self.file = file;
            self.line = line;
        }
        self
    }

    pub fn is_defect(&self) -> bool {
        self.kind.is_defect()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        match (&self.line, &self.file) {
            (Some(line), Some(file)) => write!(f, " (line: {line}, file: {file})"),
            (Some(line), None) => write!(f, " (line: {line})"),
            (None, Some(file)) => write!(f, " (file: {file})"),
            (None, None) => Ok(()),
        }
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for EngineError {
    fn from(kind: ErrorKind) -> Self {
        EngineError::new(kind)
    }
}
