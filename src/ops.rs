use crate::types::{Snapshot, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a mutation does to each key it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Install the carried value verbatim
    #[serde(rename = "set")]
    Set,

    /// Remove the key; the carried value is ignored
    #[serde(rename = "del")]
    Delete,

    /// An action added by a newer node; applying it is a no-op
    #[serde(other)]
    Unknown,
}

/// A batch entry: one action applied to a set of keys.
///
/// Field names match the wire format (`{"Action":"set","Data":{..}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "Action")]
    pub action: Action,
    #[serde(rename = "Data")]
    pub data: BTreeMap<String, Value>,
}

impl Mutation {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            action: Action::Set,
            data: BTreeMap::from([(key.into(), value)]),
        }
    }

    /// Deletes carry `null` for every key
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            action: Action::Delete,
            data: BTreeMap::from([(key.into(), Value::Null)]),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }
}

/// Core state: the key-value map a node serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvState {
    data: BTreeMap<String, Value>,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether applying `mutation` would leave the state unchanged
    pub fn is_noop(&self, mutation: &Mutation) -> bool {
        match mutation.action {
            Action::Set => mutation
                .data
                .iter()
                .all(|(key, value)| self.data.get(key) == Some(value)),
            Action::Delete => mutation.keys().all(|key| !self.data.contains_key(key)),
            Action::Unknown => true,
        }
    }

    /// Apply a mutation - the only way to change the map besides a snapshot merge
    pub fn execute(&mut self, mutation: &Mutation) {
        match mutation.action {
            Action::Set => {
                for (key, value) in &mutation.data {
                    self.data.insert(key.clone(), value.clone());
                }
            }
            Action::Delete => {
                for key in mutation.keys() {
                    self.data.remove(key);
                }
            }
            Action::Unknown => {}
        }
    }

    /// Overwrite every key present in `snapshot`; keys it lacks are kept
    pub fn merge(&mut self, snapshot: Snapshot) -> usize {
        let written = snapshot.len();
        self.data.extend(snapshot);
        written
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn snapshot(&self) -> Snapshot {
        self.data.clone()
    }
}
