//! Vireo VM
//!
//! The execution core of the Vireo scripting engine: a vector register
//! machine interpreting addressed instruction streams against a partitioned
//! virtual memory, plus the assembler that produces those streams from the
//! textual intermediate language.

pub mod assembler;
pub mod dispatch;
pub mod exec;
pub mod interconnect;
pub mod isa;
pub mod memory;
pub mod processor;
pub mod vm;

pub use vireo_core::{EngineError, ErrorKind, ValueKind};
