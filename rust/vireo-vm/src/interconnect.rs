//! The boundary to the host: symbol resolution and external calls.
//!
//! The compiler front end and the plugin layer live outside this crate; the
//! assembler and the dispatch unit only ever see them through these two
//! traits. The map- and closure-backed implementations below are enough for
//! hosts with a fixed binding set, and for tests.

use std::collections::HashMap;

use vireo_core::{EngineError, ErrorKind};

use crate::memory::ContainerRef;

/// Resolves assembly-level identifiers to canonical addresses.
pub trait SymbolResolver {
    /// The GLOBAL-partition address of a global variable.
    fn global_variable_address(&self, identifier: &str) -> Option<usize>;

    /// The canonical address of a global function: the entry instruction
    /// index for script functions, the call-table index for host functions.
    fn global_function_address(&self, identifier: &str) -> Option<usize>;

    /// The external-function-table index of a host function signature.
    fn external_function_index(&self, signature: &str) -> Option<usize>;
}

/// Invokes host functions on behalf of the CALLX instruction, synchronously.
pub trait ExternalCaller {
    /// Calls the external function at `index` with the given argument
    /// containers, writing its result into `ret` before returning.
    fn invoke(
        &mut self,
        index: usize,
        args: &[ContainerRef],
        ret: &ContainerRef,
    ) -> Result<(), EngineError>;
}

/// A map-backed symbol resolver.
#[derive(Debug, Default)]
pub struct SymbolMap {
    globals: HashMap<String, usize>,
    functions: HashMap<String, usize>,
    externals: HashMap<String, usize>,
}

impl SymbolMap {
    pub fn new() -> Self {
        SymbolMap::default()
    }

    pub fn add_global(&mut self, identifier: impl Into<String>, address: usize) {
        self.globals.insert(identifier.into(), address);
    }

    pub fn add_function(&mut self, identifier: impl Into<String>, address: usize) {
        self.functions.insert(identifier.into(), address);
    }

    pub fn add_external(&mut self, signature: impl Into<String>, index: usize) {
        self.externals.insert(signature.into(), index);
    }
}

impl SymbolResolver for SymbolMap {
    fn global_variable_address(&self, identifier: &str) -> Option<usize> {
        self.globals.get(identifier).copied()
    }

    fn global_function_address(&self, identifier: &str) -> Option<usize> {
        self.functions.get(identifier).copied()
    }

    fn external_function_index(&self, signature: &str) -> Option<usize> {
        self.externals.get(signature).copied()
    }
}

/// A boxed host function: arguments in, result container out.
pub type HostFunction =
    Box<dyn FnMut(&[ContainerRef], &ContainerRef) -> Result<(), EngineError>>;

/// An external-call table backed by boxed closures, indexed by position.
#[derive(Default)]
pub struct HostFunctionTable {
    functions: Vec<HostFunction>,
}

impl HostFunctionTable {
    pub fn new() -> Self {
        HostFunctionTable::default()
    }

    /// Registers a host function and returns its external-function index.
    pub fn register(&mut self, function: HostFunction) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl ExternalCaller for HostFunctionTable {
    fn invoke(
        &mut self,
        index: usize,
        args: &[ContainerRef],
        ret: &ContainerRef,
    ) -> Result<(), EngineError> {
        let function = self
            .functions
            .get_mut(index)
            .ok_or_else(|| ErrorKind::ExternalCall {
                message: format!("no external function is registered at index {index}"),
            })?;
        function(args, ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{container_ref, ValueContainer};

    #[test]
    fn symbol_map_resolves_by_category() {
        let mut symbols = SymbolMap::new();
        symbols.add_global("_total", 0);
        symbols.add_function("_twice", 8);
        symbols.add_external("twice(int)", 1);

        assert_eq!(symbols.global_variable_address("_total"), Some(0));
        assert_eq!(symbols.global_function_address("_twice"), Some(8));
        assert_eq!(symbols.external_function_index("twice(int)"), Some(1));
        assert_eq!(symbols.global_variable_address("_missing"), None);
    }

    #[test]
    fn host_function_table_dispatches_by_index() {
        let mut table = HostFunctionTable::new();
        let index = table.register(Box::new(|args, ret| {
            let a = args[0].borrow().get_int64_scalar()?;
            ret.borrow_mut().set_int64_scalar(a * 2)
        }));

        let arg = container_ref(ValueContainer::int64_scalar(21));
        let ret = container_ref(ValueContainer::new());
        table.invoke(index, &[arg], &ret).unwrap();
        assert_eq!(ret.borrow().get_int64_scalar().unwrap(), 42);
    }

    #[test]
    fn unknown_external_index_is_a_catchable_error() {
        let mut table = HostFunctionTable::new();
        let ret = container_ref(ValueContainer::new());
        let err = table.invoke(5, &[], &ret).unwrap_err();
        assert!(!err.is_defect());
        assert!(matches!(err.kind, ErrorKind::ExternalCall { .. }));
    }
}
