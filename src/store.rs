use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Channel,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Number,
    String,
}

/// Declaration of a node in the state tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDef {
    pub kind: ObjectKind,
    pub name: String,
    pub value_type: Option<ValueType>,
    pub role: Option<String>,
    pub read: bool,
    pub write: bool,
    pub unit: Option<String>,
    pub def: Option<Value>,
    pub states: Option<BTreeMap<i64, String>>,
}

impl ObjectDef {
    pub fn channel(name: &str) -> ObjectDef {
        ObjectDef {
            kind: ObjectKind::Channel,
            name: name.to_string(),
            value_type: None,
            role: None,
            read: true,
            write: false,
            unit: None,
            def: None,
            states: None,
        }
    }

    /// A read-only state.
    pub fn state(name: &str, value_type: ValueType, role: &str) -> ObjectDef {
        ObjectDef {
            kind: ObjectKind::State,
            value_type: Some(value_type),
            role: Some(role.to_string()),
            ..ObjectDef::channel(name)
        }
    }

    pub fn writable(mut self) -> ObjectDef {
        self.write = true;
        self
    }

    pub fn unit(mut self, unit: &str) -> ObjectDef {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn default_value(mut self, def: Value) -> ObjectDef {
        self.def = Some(def);
        self
    }

    pub fn labels(mut self, states: BTreeMap<i64, String>) -> ObjectDef {
        self.states = Some(states);
        self
    }
}

/// The current value of a state. `ack` marks values written by the bridge itself.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub val: Value,
    pub ack: bool,
    pub ts: u64,
}

impl State {
    pub fn new(val: Value, ack: bool) -> State {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        State { val, ack, ts }
    }
}

/// Hierarchical key/value store the bridge mirrors the UPS into.
pub trait StateStore {
    /// Declares an object unless one already exists. Returns whether it was created.
    fn set_object_not_exists(&mut self, id: &str, def: ObjectDef) -> Result<bool, StoreError>;

    fn get_object(&self, id: &str) -> Result<Option<ObjectDef>, StoreError>;

    fn get_state(&self, id: &str) -> Result<Option<State>, StoreError>;

    fn set_state(&mut self, id: &str, val: Value, ack: bool) -> Result<(), StoreError>;

    /// Registers interest in writes to ids matching `pattern` (`prefix.*` or an exact id).
    fn subscribe_states(&mut self, pattern: &str) -> Result<(), StoreError>;

    fn is_subscribed(&self, id: &str) -> bool;

    /// Every state value as nested JSON, one level per dotted path segment.
    fn dump(&self) -> Value;
}

fn check_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.starts_with('.') || id.ends_with('.') || id.contains("..") {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn matches_pattern(pattern: &str, id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => pattern == id,
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: BTreeMap<String, ObjectDef>,
    states: BTreeMap<String, State>,
    subscriptions: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.states.get(id).map(|s| &s.val)
    }

    fn build_tree(&self) -> Value {
        let mut root = Map::new();
        for (id, state) in &self.states {
            let mut node = &mut root;
            let mut parts = id.split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), state.val.clone());
                    break;
                }
                let child = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                match child {
                    Value::Object(map) => node = map,
                    // A value already sits where a channel would go; keep the value.
                    _ => break,
                }
            }
        }
        Value::Object(root)
    }
}

impl StateStore for MemoryStore {
    fn set_object_not_exists(&mut self, id: &str, def: ObjectDef) -> Result<bool, StoreError> {
        check_id(id)?;
        if self.objects.contains_key(id) {
            return Ok(false);
        }
        self.objects.insert(id.to_string(), def);
        Ok(true)
    }

    fn get_object(&self, id: &str) -> Result<Option<ObjectDef>, StoreError> {
        check_id(id)?;
        Ok(self.objects.get(id).cloned())
    }

    fn get_state(&self, id: &str) -> Result<Option<State>, StoreError> {
        check_id(id)?;
        Ok(self.states.get(id).cloned())
    }

    fn set_state(&mut self, id: &str, val: Value, ack: bool) -> Result<(), StoreError> {
        check_id(id)?;
        match self.objects.get(id) {
            Some(def) if def.kind == ObjectKind::State => {
                self.states.insert(id.to_string(), State::new(val, ack));
                Ok(())
            }
            _ => Err(StoreError::NoObject(id.to_string())),
        }
    }

    fn subscribe_states(&mut self, pattern: &str) -> Result<(), StoreError> {
        if !self.subscriptions.iter().any(|p| p == pattern) {
            self.subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    fn is_subscribed(&self, id: &str) -> bool {
        self.subscriptions.iter().any(|p| matches_pattern(p, id))
    }

    fn dump(&self) -> Value {
        self.build_tree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_is_existence_checked() {
        let mut store = MemoryStore::new();
        let def = ObjectDef::state("status.severity", ValueType::Number, "indicator");
        assert!(store.set_object_not_exists("status.severity", def).unwrap());

        let other = ObjectDef::state("status.severity", ValueType::String, "state");
        assert!(!store.set_object_not_exists("status.severity", other).unwrap());
        assert_eq!(
            store.get_object("status.severity").unwrap().unwrap().value_type,
            Some(ValueType::Number)
        );
    }

    #[test]
    fn states_need_a_state_object() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.set_state("ups.status", json!("OL"), true),
            Err(StoreError::NoObject(_))
        ));

        store.set_object_not_exists("ups", ObjectDef::channel("ups")).unwrap();
        assert!(store.set_state("ups", json!("OL"), true).is_err());
    }

    #[test]
    fn rejects_malformed_ids() {
        let mut store = MemoryStore::new();
        for id in ["", ".foo", "foo.", "a..b"] {
            let def = ObjectDef::channel(id);
            assert!(store.set_object_not_exists(id, def).is_err(), "{:?}", id);
        }
    }

    #[test]
    fn subscriptions_match_prefixes() {
        let mut store = MemoryStore::new();
        store.subscribe_states("commands.*").unwrap();
        store.subscribe_states("commands.*").unwrap();
        assert!(store.is_subscribed("commands.load-off"));
        assert!(!store.is_subscribed("status.severity"));
        assert_eq!(store.subscriptions.len(), 1);
    }

    #[test]
    fn dump_nests_by_path() {
        let mut store = MemoryStore::new();
        for id in ["battery.charge", "battery.voltage", "info.connection"] {
            store
                .set_object_not_exists(id, ObjectDef::state(id, ValueType::String, "state"))
                .unwrap();
        }
        store.set_state("battery.charge", json!(87), true).unwrap();
        store.set_state("battery.voltage", json!("13.5"), true).unwrap();
        store.set_state("info.connection", json!(false), true).unwrap();

        assert_eq!(
            store.dump(),
            json!({
                "battery": { "charge": 87, "voltage": "13.5" },
                "info": { "connection": false }
            })
        );
    }
}
