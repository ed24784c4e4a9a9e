//! The external namespace contract (spec §4.7): the core never owns the
//! evaluator's variable dictionary directly, it only talks to it through
//! this trait, the same way `ahma_core` never owns the shell process's
//! environment directly but mediates it through `ShellPoolManager`.

use sies_wire::RestoreMode;
use std::collections::HashMap;
use std::sync::Mutex;

/// Whether an `update` call may overwrite reserved engine-internals keys
/// (spec §4.7: `policy ∈ {merge, engine}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    Merge,
    Engine,
}

/// The collaborator a real evaluator (e.g. an embedded scripting language)
/// must provide. The core only ever merges into this map, snapshots it, or
/// restores it — it never replaces the object identity, per spec §4.7 and
/// the persistence invariant in spec §8.1.
pub trait NamespaceStore: Send + Sync {
    /// Merge `kv` into the namespace in place. `Merge` policy must not
    /// overwrite reserved engine-internals keys; `Engine` policy may.
    fn update(&self, kv: HashMap<String, serde_json::Value>, policy: UpdatePolicy);

    /// An opaque serialized snapshot of the non-internal projection, used
    /// for `checkpoint`.
    fn snapshot(&self) -> Vec<u8>;

    /// Apply a previously taken snapshot. In `Merge` mode, existing
    /// non-internal keys present in the snapshot are overwritten by the
    /// snapshot's values and internals are preserved; in `ClearThenMerge`,
    /// non-internal keys are cleared first and internals are
    /// reinitialized before merging.
    fn restore(&self, snapshot: &[u8], mode: RestoreMode);

    /// Rotate the `_`, `__`, `___` result history within the
    /// engine-internals subset (spec §4.7).
    fn record_expression_result(&self, value: serde_json::Value);

    /// Whether the `input` symbol is currently bound (spec §8.1 invariant
    /// 7: "the injected `input` symbol remains bound").
    fn has_input_binding(&self) -> bool;

    /// Bind (or rebind) the `input` symbol. Called once by the executor's
    /// prepare step and left untouched afterward (spec §4.4 step 7:
    /// "Do not remove the injected `input`").
    fn bind_input(&self);

    /// Whether the stdout/stderr writer override is currently installed
    /// (spec §4.7: "output redirectors... injected once and persist across
    /// executions"), mirroring `has_input_binding`.
    fn has_output_binding(&self) -> bool;

    /// Bind (or rebind) the output redirector. Called once by the
    /// executor's prepare step, left untouched afterward.
    fn bind_output(&self);

    /// Total key count, internals included — reported as `namespace_size`
    /// in the worker's heartbeat (spec §4.5).
    fn size(&self) -> u64;
}

const RESULT_HISTORY_KEYS: [&str; 3] = ["_", "__", "___"];
const INTERNAL_PREFIX: &str = "__sies_";

struct State {
    values: HashMap<String, serde_json::Value>,
    has_input: bool,
    has_output: bool,
}

impl State {
    fn is_internal(key: &str) -> bool {
        key.starts_with(INTERNAL_PREFIX) || RESULT_HISTORY_KEYS.contains(&key)
    }
}

/// A reference `NamespaceStore` sufficient for tests and the `sies-cli`
/// demonstration binary (spec §4.7 closing note: "a reference
/// implementation ... sufficient for tests"). A production embedding would
/// replace this with a real interpreter's globals dict.
pub struct InMemoryNamespace {
    state: Mutex<State>,
}

impl InMemoryNamespace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                values: HashMap::new(),
                has_input: false,
                has_output: false,
            }),
        }
    }

    /// Read-only peek used by tests to assert on namespace contents
    /// without going through serialization.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().unwrap().values.get(key).cloned()
    }
}

impl Default for InMemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceStore for InMemoryNamespace {
    fn update(&self, kv: HashMap<String, serde_json::Value>, policy: UpdatePolicy) {
        let mut state = self.state.lock().unwrap();
        for (key, value) in kv {
            if policy == UpdatePolicy::Merge && State::is_internal(&key) {
                continue;
            }
            state.values.insert(key, value);
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let projection: HashMap<&String, &serde_json::Value> = state
            .values
            .iter()
            .filter(|(k, _)| !State::is_internal(k))
            .collect();
        serde_json::to_vec(&projection).unwrap_or_default()
    }

    fn restore(&self, snapshot: &[u8], mode: RestoreMode) {
        let incoming: HashMap<String, serde_json::Value> =
            serde_json::from_slice(snapshot).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if matches!(mode, RestoreMode::ClearThenMerge) {
            state.values.retain(|k, _| State::is_internal(k));
        }
        for (key, value) in incoming {
            if State::is_internal(&key) {
                continue;
            }
            state.values.insert(key, value);
        }
    }

    fn record_expression_result(&self, value: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        let prev_1 = state.values.get(RESULT_HISTORY_KEYS[0]).cloned();
        let prev_2 = state.values.get(RESULT_HISTORY_KEYS[1]).cloned();
        if let Some(v) = prev_2 {
            state.values.insert(RESULT_HISTORY_KEYS[2].into(), v);
        }
        if let Some(v) = prev_1 {
            state.values.insert(RESULT_HISTORY_KEYS[1].into(), v);
        }
        state.values.insert(RESULT_HISTORY_KEYS[0].into(), value);
    }

    fn has_input_binding(&self) -> bool {
        self.state.lock().unwrap().has_input
    }

    fn bind_input(&self) {
        self.state.lock().unwrap().has_input = true;
    }

    fn has_output_binding(&self) -> bool {
        self.state.lock().unwrap().has_output
    }

    fn bind_output(&self) {
        self.state.lock().unwrap().has_output = true;
    }

    fn size(&self) -> u64 {
        self.state.lock().unwrap().values.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_policy_does_not_overwrite_internals() {
        let ns = InMemoryNamespace::new();
        ns.record_expression_result(json!(1));
        let mut kv = HashMap::new();
        kv.insert("_".to_string(), json!("clobbered"));
        ns.update(kv, UpdatePolicy::Merge);
        assert_eq!(ns.get("_"), Some(json!(1)));
    }

    #[test]
    fn engine_policy_can_overwrite_internals() {
        let ns = InMemoryNamespace::new();
        ns.record_expression_result(json!(1));
        let mut kv = HashMap::new();
        kv.insert("_".to_string(), json!("overwritten"));
        ns.update(kv, UpdatePolicy::Engine);
        assert_eq!(ns.get("_"), Some(json!("overwritten")));
    }

    #[test]
    fn result_history_rotates_through_three_slots() {
        let ns = InMemoryNamespace::new();
        ns.record_expression_result(json!(1));
        ns.record_expression_result(json!(2));
        ns.record_expression_result(json!(3));
        assert_eq!(ns.get("_"), Some(json!(3)));
        assert_eq!(ns.get("__"), Some(json!(2)));
        assert_eq!(ns.get("___"), Some(json!(1)));
    }

    #[test]
    fn checkpoint_then_restore_merge_round_trips_non_internal_state() {
        let ns = InMemoryNamespace::new();
        let mut kv = HashMap::new();
        kv.insert("x".to_string(), json!(42));
        ns.update(kv, UpdatePolicy::Merge);
        let snap = ns.snapshot();

        let restored = InMemoryNamespace::new();
        restored.restore(&snap, RestoreMode::Merge);
        assert_eq!(restored.get("x"), Some(json!(42)));
    }

    #[test]
    fn clear_then_merge_drops_existing_non_internal_keys_first() {
        let ns = InMemoryNamespace::new();
        let mut kv = HashMap::new();
        kv.insert("stale".to_string(), json!(true));
        ns.update(kv, UpdatePolicy::Merge);

        let snap = serde_json::to_vec(&HashMap::from([("fresh".to_string(), json!(1))])).unwrap();
        ns.restore(&snap, RestoreMode::ClearThenMerge);

        assert_eq!(ns.get("stale"), None);
        assert_eq!(ns.get("fresh"), Some(json!(1)));
    }

    #[test]
    fn input_binding_persists_once_set() {
        let ns = InMemoryNamespace::new();
        assert!(!ns.has_input_binding());
        ns.bind_input();
        assert!(ns.has_input_binding());
    }

    #[test]
    fn output_binding_persists_once_set() {
        let ns = InMemoryNamespace::new();
        assert!(!ns.has_output_binding());
        ns.bind_output();
        assert!(ns.has_output_binding());
    }

    #[test]
    fn size_reflects_key_count() {
        let ns = InMemoryNamespace::new();
        assert_eq!(ns.size(), 0);
        let mut kv = HashMap::new();
        kv.insert("a".to_string(), json!(1));
        kv.insert("b".to_string(), json!(2));
        ns.update(kv, UpdatePolicy::Merge);
        assert_eq!(ns.size(), 2);
    }
}
