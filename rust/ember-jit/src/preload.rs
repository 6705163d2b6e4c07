//! Single-threaded preloading.
//!
//! Before any worker starts, every unit that is about to be compiled gets a
//! [`PreloadedUnit`]: an immutable snapshot of the metadata the backend needs.
//! Workers only ever read these snapshots, which is what makes it sound to
//! relax the cross-thread metadata check while they run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ember_rt::{CodeId, CodeRuntime};
use serde::Serialize;
use serde_json::Value;

use crate::registry::CodeRegistry;
use crate::unit::{CodeObject, Globals, Unit, UnitKey, UnitStatus};

/// Metadata captured for one unit at preload time.
#[derive(Debug, Clone, Serialize)]
pub struct PreloadedMetadata {
    pub fullname: String,
    pub module: String,
    pub qualname: String,
    pub is_static: bool,
    /// Values of the globals the code reads, as seen at preload time.
    pub globals: Vec<(String, Option<Value>)>,
    /// Nested code units discovered in this unit's constants.
    pub nested: Vec<UnitKey>,
}

#[derive(Debug)]
pub struct PreloadedUnit {
    pub key: UnitKey,
    pub code: Arc<CodeObject>,
    pub globals: Arc<Globals>,
    pub metadata: PreloadedMetadata,
}

impl PreloadedUnit {
    /// A fresh [`CodeRuntime`] carrying this unit's identity, for backends
    /// to return from a successful compile.
    pub fn code_runtime(&self) -> Arc<CodeRuntime> {
        CodeRuntime::with_id(self.code.id, &self.metadata.module, &self.metadata.qualname)
    }
}

/// Preloaded units of one compile run, keyed by unit and by code object.
#[derive(Debug, Default)]
pub struct PreloadMap {
    units: HashMap<UnitKey, Arc<PreloadedUnit>>,
    by_code: HashMap<CodeId, UnitKey>,
    order: Vec<UnitKey>,
}

impl PreloadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, key: UnitKey) -> bool {
        self.units.contains_key(&key)
    }

    pub fn get(&self, key: UnitKey) -> Option<&Arc<PreloadedUnit>> {
        self.units.get(&key)
    }

    /// Look a unit up by its code object.
    pub fn get_by_code(&self, code: CodeId) -> Option<&Arc<PreloadedUnit>> {
        self.by_code.get(&code).and_then(|key| self.units.get(key))
    }

    /// Units in the order they were preloaded.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PreloadedUnit>> + '_ {
        self.order.iter().filter_map(|key| self.units.get(key))
    }

    pub fn insert(&mut self, unit: PreloadedUnit) {
        let key = unit.key;
        self.by_code.entry(unit.code.id).or_insert(key);
        self.order.push(key);
        self.units.insert(key, Arc::new(unit));
    }
}

// ---------------------------------------------------------------------------
// Nested discovery
// ---------------------------------------------------------------------------

/// Breadth-first search of `root`'s constants for eligible nested code
/// objects. Each code object is visited once, however many paths reach it.
/// Anonymous code and ineligible code are skipped along with everything
/// nested inside them.
pub fn find_nested_codes(
    root: &CodeObject,
    mut eligible: impl FnMut(&CodeObject) -> bool,
) -> Vec<Arc<CodeObject>> {
    let mut queue: VecDeque<&CodeObject> = VecDeque::from([root]);
    let mut visited: HashSet<CodeId> = HashSet::from([root.id]);
    let mut found = Vec::new();

    while let Some(code) = queue.pop_front() {
        for nested in code.nested_codes() {
            if !visited.insert(nested.id) || nested.qualname.is_none() || !eligible(nested) {
                continue;
            }
            found.push(Arc::clone(nested));
            queue.push_back(nested);
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Preloading
// ---------------------------------------------------------------------------

/// Snapshot the metadata of a single unit.
pub fn preload_unit(
    unit: &Unit,
    module: &str,
    globals: &Arc<Globals>,
    nested: Vec<UnitKey>,
) -> PreloadedUnit {
    let code = unit.code();
    let qualname = code.qualname.clone().unwrap_or_default();
    let snapshot = code
        .names
        .iter()
        .map(|name| (name.clone(), globals.get(name)))
        .collect();
    PreloadedUnit {
        key: unit.key(),
        code: Arc::clone(code),
        globals: Arc::clone(globals),
        metadata: PreloadedMetadata {
            fullname: format!("{module}:{qualname}"),
            module: module.to_string(),
            qualname,
            is_static: code.is_static,
            globals: snapshot,
            nested,
        },
    }
}

/// Drain the registry's pending set into `map`, following nested code.
///
/// Newly discovered nested units are registered as code units (inheriting
/// the module and globals of the unit they were found in) and preloaded in
/// the same pass. A unit already in `map`, or whose code is already
/// compiled, is not preloaded again. Returns the keys preloaded by this call.
pub fn preload_pending(
    registry: &mut CodeRegistry,
    map: &mut PreloadMap,
    mut eligible: impl FnMut(&str, &CodeObject) -> bool,
) -> Vec<UnitKey> {
    let mut preloaded = Vec::new();
    loop {
        let batch = registry.take_pending();
        if batch.is_empty() {
            break;
        }
        for unit in batch {
            let key = unit.key();
            if map.contains(key) {
                continue;
            }
            let Some((module, globals)) = registry.unit_context(&unit) else {
                tracing::warn!(unit = %key, "no module data for code unit; declining");
                registry.record(key, UnitStatus::Declined, None);
                continue;
            };

            let mut nested_keys = Vec::new();
            for nested in find_nested_codes(unit.code(), |c| eligible(&module, c)) {
                let nested_key = UnitKey::Code(nested.id);
                nested_keys.push(nested_key);
                if map.contains(nested_key) || registry.is_code_compiled(nested.id) {
                    continue;
                }
                registry.add_code(nested, &module, Arc::clone(&globals));
            }

            tracing::debug!(unit = %key, nested = nested_keys.len(), "preloaded unit");
            map.insert(preload_unit(&unit, &module, &globals, nested_keys));
            preloaded.push(key);
        }
    }
    preloaded
}
