//! The code registry: which units are waiting to be compiled, which have
//! been, and the module data needed to compile bare code objects.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ember_rt::{CodeId, CodeRuntime};

use crate::unit::{CodeObject, FunctionId, FunctionObject, Globals, Unit, UnitKey, UnitStatus};

/// Module context of a code unit found nested inside a function.
#[derive(Debug, Clone)]
pub struct CodeData {
    pub module: String,
    pub globals: Arc<Globals>,
}

#[derive(Debug, Default)]
pub struct CodeRegistry {
    pending: BTreeMap<UnitKey, Unit>,
    code_data: HashMap<CodeId, CodeData>,
    /// Compiled code, keyed by code object so every function sharing a code
    /// object can attach it.
    compiled: HashMap<CodeId, Arc<CodeRuntime>>,
    status: HashMap<UnitKey, UnitStatus>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- pending set --------------------------------------------------------

    pub fn add_function(&mut self, func: &Arc<FunctionObject>) {
        let key = func.key();
        self.pending.insert(key, Unit::Function(Arc::clone(func)));
        self.status.insert(key, UnitStatus::Pending);
    }

    pub fn add_code(&mut self, code: Arc<CodeObject>, module: &str, globals: Arc<Globals>) {
        let key = UnitKey::Code(code.id);
        self.code_data.entry(code.id).or_insert_with(|| CodeData {
            module: module.to_string(),
            globals,
        });
        self.pending.insert(key, Unit::Code(code));
        self.status.insert(key, UnitStatus::Pending);
    }

    pub fn is_pending(&self, key: UnitKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove one unit from the pending set.
    pub fn remove_pending(&mut self, key: UnitKey) -> Option<Unit> {
        self.pending.remove(&key)
    }

    /// Drain the whole pending set.
    pub fn take_pending(&mut self) -> Vec<Unit> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    // -- module data ----------------------------------------------------------

    pub fn code_data(&self, id: CodeId) -> Option<&CodeData> {
        self.code_data.get(&id)
    }

    /// Module name and globals a unit compiles against.
    pub fn unit_context(&self, unit: &Unit) -> Option<(String, Arc<Globals>)> {
        match unit {
            Unit::Function(func) => Some((func.module.clone(), Arc::clone(&func.globals))),
            Unit::Code(code) => self
                .code_data
                .get(&code.id)
                .map(|data| (data.module.clone(), Arc::clone(&data.globals))),
        }
    }

    pub fn clear_code_data(&mut self) {
        self.code_data.clear();
    }

    // -- results --------------------------------------------------------------

    /// Compiled code for `func`'s code object, if any.
    pub fn attach(&self, func: &FunctionObject) -> Option<Arc<CodeRuntime>> {
        self.compiled.get(&func.code.id).cloned()
    }

    pub fn is_code_compiled(&self, id: CodeId) -> bool {
        self.compiled.contains_key(&id)
    }

    pub fn compiled_code(&self, id: CodeId) -> Option<&Arc<CodeRuntime>> {
        self.compiled.get(&id)
    }

    pub fn record(&mut self, key: UnitKey, status: UnitStatus, code: Option<Arc<CodeRuntime>>) {
        if let Some(code) = code {
            self.compiled.insert(code.id(), code);
        }
        self.status.insert(key, status);
    }

    pub fn status(&self, key: UnitKey) -> Option<UnitStatus> {
        self.status.get(&key).copied()
    }

    /// Drop all compiled code. Units that had finished are no longer tracked,
    /// so `status` stops reporting them as done.
    pub fn clear_compiled(&mut self) {
        self.compiled.clear();
        self.status.retain(|_, status| *status != UnitStatus::Done);
    }

    // -- teardown -------------------------------------------------------------

    pub fn forget_function(&mut self, id: FunctionId) {
        let key = UnitKey::Function(id);
        self.pending.remove(&key);
        self.status.remove(&key);
    }

    pub fn forget_code(&mut self, id: CodeId) {
        let key = UnitKey::Code(id);
        self.pending.remove(&key);
        self.status.remove(&key);
        self.code_data.remove(&id);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.code_data.clear();
        self.compiled.clear();
        self.status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str) -> Arc<FunctionObject> {
        FunctionObject::new(Arc::new(CodeObject::new(name)), "m", Globals::new())
    }

    #[test]
    fn take_pending_is_destructive() {
        let mut registry = CodeRegistry::new();
        registry.add_function(&func("a"));
        registry.add_function(&func("b"));
        assert_eq!(registry.pending_count(), 2);
        assert_eq!(registry.take_pending().len(), 2);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn attach_finds_code_compiled_for_a_sibling_function() {
        let mut registry = CodeRegistry::new();
        let code = Arc::new(CodeObject::new("shared"));
        let first = FunctionObject::new(Arc::clone(&code), "m", Globals::new());
        let second = FunctionObject::new(Arc::clone(&code), "m", Globals::new());
        let runtime = CodeRuntime::with_id(code.id, "m", "shared");
        registry.record(first.key(), UnitStatus::Done, Some(runtime));
        assert!(registry.attach(&second).is_some());
    }

    #[test]
    fn clearing_compiled_code_forgets_done_units() {
        let mut registry = CodeRegistry::new();
        let done = func("done");
        let declined = func("declined");
        let waiting = func("waiting");
        registry.add_function(&waiting);
        let runtime = CodeRuntime::with_id(done.code.id, "m", "done");
        registry.record(done.key(), UnitStatus::Done, Some(runtime));
        registry.record(declined.key(), UnitStatus::Declined, None);

        registry.clear_compiled();
        assert!(registry.attach(&done).is_none());
        assert_eq!(registry.status(done.key()), None);
        assert_eq!(registry.status(declined.key()), Some(UnitStatus::Declined));
        assert_eq!(registry.status(waiting.key()), Some(UnitStatus::Pending));
    }

    #[test]
    fn forgetting_code_drops_module_data() {
        let mut registry = CodeRegistry::new();
        let code = Arc::new(CodeObject::new("nested"));
        let id = code.id;
        registry.add_code(code, "m", Globals::new());
        assert!(registry.code_data(id).is_some());
        registry.forget_code(id);
        assert!(registry.code_data(id).is_none());
        assert!(!registry.is_pending(UnitKey::Code(id)));
    }
}
