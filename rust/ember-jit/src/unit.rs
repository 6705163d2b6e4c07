//! Compilation units and the host objects they are made of.
//!
//! A unit is either a function (a code object bound to a module and its
//! globals) or a bare code object nested inside another unit's constants,
//! which borrows the module and globals of the function it was found in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_rt::CodeId;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use serde_json::Value;
use strum::{Display, EnumIter, FromRepr};

// ---------------------------------------------------------------------------
// Host objects
// ---------------------------------------------------------------------------

/// A constant in a code object's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Code(Arc<CodeObject>),
    Value(Value),
}

/// A code object as handed over by the host.
#[derive(Debug)]
pub struct CodeObject {
    pub id: CodeId,
    /// `None` for anonymous code, which is never compiled on its own.
    pub qualname: Option<String>,
    pub is_static: bool,
    /// Global names the code reads.
    pub names: Vec<String>,
    pub consts: Vec<Constant>,
}

impl CodeObject {
    pub fn new(qualname: impl Into<String>) -> Self {
        Self {
            id: CodeId::next(),
            qualname: Some(qualname.into()),
            is_static: false,
            names: Vec::new(),
            consts: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            qualname: None,
            ..Self::new("")
        }
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn with_const(mut self, constant: Constant) -> Self {
        self.consts.push(constant);
        self
    }

    pub fn with_nested(self, code: &Arc<CodeObject>) -> Self {
        self.with_const(Constant::Code(Arc::clone(code)))
    }

    /// Nested code objects in the constant pool, in pool order.
    pub fn nested_codes(&self) -> impl Iterator<Item = &Arc<CodeObject>> + '_ {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code),
            Constant::Value(_) => None,
        })
    }
}

/// A module's global namespace. Shared across threads; reads during a
/// threaded compile go through [`CompileContext`](crate::CompileContext).
#[derive(Debug, Default)]
pub struct Globals {
    values: RwLock<BTreeMap<String, Value>>,
}

impl Globals {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Arc::new(Self {
            values: RwLock::new(values),
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.values.write().insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl FunctionId {
    pub fn next() -> Self {
        Self(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionId({})", self.0)
    }
}

#[derive(Debug)]
pub struct FunctionObject {
    pub id: FunctionId,
    pub code: Arc<CodeObject>,
    pub module: String,
    pub globals: Arc<Globals>,
}

impl FunctionObject {
    pub fn new(code: Arc<CodeObject>, module: impl Into<String>, globals: Arc<Globals>) -> Arc<Self> {
        Arc::new(Self {
            id: FunctionId::next(),
            code,
            module: module.into(),
            globals,
        })
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::Function(self.id)
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Identity of a compilation unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitKey {
    Function(FunctionId),
    Code(CodeId),
}

impl fmt::Debug for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Function(id) => write!(f, "func:{}", id.0),
            UnitKey::Code(id) => write!(f, "code:{}", id.as_u64()),
        }
    }
}

impl Serialize for UnitKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A unit waiting in the registry.
#[derive(Debug, Clone)]
pub enum Unit {
    Function(Arc<FunctionObject>),
    Code(Arc<CodeObject>),
}

impl Unit {
    pub fn key(&self) -> UnitKey {
        match self {
            Unit::Function(func) => func.key(),
            Unit::Code(code) => UnitKey::Code(code.id),
        }
    }

    pub fn code(&self) -> &Arc<CodeObject> {
        match self {
            Unit::Function(func) => &func.code,
            Unit::Code(code) => code,
        }
    }
}

/// Lifecycle of a unit. Stored as a `u8` in the scheduler's per-unit slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize)]
#[repr(u8)]
pub enum UnitStatus {
    Pending,
    Preloading,
    Compiling,
    Done,
    Retry,
    Declined,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Declined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn status_round_trips_through_repr() {
        for status in UnitStatus::iter() {
            assert_eq!(UnitStatus::from_repr(status as u8), Some(status));
        }
        assert!(UnitStatus::Done.is_terminal());
        assert!(!UnitStatus::Retry.is_terminal());
    }

    #[test]
    fn nested_codes_skip_plain_constants() {
        let inner = Arc::new(CodeObject::new("outer.<locals>.inner"));
        let outer = CodeObject::new("outer")
            .with_const(Constant::Value(serde_json::json!(1)))
            .with_nested(&inner);
        let nested: Vec<_> = outer.nested_codes().collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].id, inner.id);
    }

    #[test]
    fn unit_keys_display_and_serialize() {
        let code = Arc::new(CodeObject::new("f"));
        let key = Unit::Code(Arc::clone(&code)).key();
        assert_eq!(key.to_string(), format!("code:{}", code.id.as_u64()));
        assert_eq!(serde_json::to_string(&key).unwrap(), format!("\"{key}\""));
    }
}
