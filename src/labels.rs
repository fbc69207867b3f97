//! Node label scheme and the per-node migration state derived from it.
//!
//! Labels are the only persisted migration state. Nothing here caches them:
//! every caller passes the labels it just read from the API server.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Label keys written to nodes by each phase. All keys share one value.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Labels {
    /// Node runs both the old and the new plugin.
    pub dual: String,
    /// Node runs the new plugin only. Also used as the migration taint key.
    pub new_plugin: String,
    pub rolled: String,
    pub priority_old: String,
    pub priority_new: String,
    pub migrated: String,
    #[serde(default = "default_value")]
    pub value: String,
}

fn default_value() -> String {
    "true".to_string()
}

/// Migration state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Neither the dual nor the new-plugin label.
    Unprepared,
    /// Both the dual and the new-plugin label; must be reset.
    Conflicting,
    Dual,
    PriorityFlipped,
    /// New-plugin label set but migration not finished.
    Migrating,
    Migrated,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Unprepared => "Unprepared",
            NodeState::Conflicting => "Conflicting",
            NodeState::Dual => "Dual",
            NodeState::PriorityFlipped => "PriorityFlipped",
            NodeState::Migrating => "Migrating",
            NodeState::Migrated => "Migrated",
        };
        f.write_str(s)
    }
}

impl Labels {
    fn has(&self, labels: &BTreeMap<String, String>, key: &str) -> bool {
        labels.contains_key(key)
    }

    fn has_value(&self, labels: &BTreeMap<String, String>, key: &str) -> bool {
        labels.get(key).is_some_and(|v| *v == self.value)
    }

    /// Derive the node state. Precedence runs from the most advanced phase down.
    pub fn state_of(&self, labels: &BTreeMap<String, String>) -> NodeState {
        if self.is_migrated(labels) {
            return NodeState::Migrated;
        }

        let dual = self.has(labels, &self.dual);
        let new_plugin = self.has(labels, &self.new_plugin);

        match (dual, new_plugin) {
            (true, true) => NodeState::Conflicting,
            (false, true) => NodeState::Migrating,
            (false, false) => NodeState::Unprepared,
            (true, false) if self.has(labels, &self.priority_new) => NodeState::PriorityFlipped,
            (true, false) => NodeState::Dual,
        }
    }

    /// Exactly one of the dual / new-plugin labels is present.
    pub fn is_prepared(&self, labels: &BTreeMap<String, String>) -> bool {
        self.has(labels, &self.dual) != self.has(labels, &self.new_plugin)
    }

    pub fn is_rolled(&self, labels: &BTreeMap<String, String>) -> bool {
        self.has_value(labels, &self.rolled)
    }

    /// The new plugin has CNI priority, or the node is already past that point.
    pub fn is_priority_flipped(&self, labels: &BTreeMap<String, String>) -> bool {
        self.has(labels, &self.priority_new) || self.has(labels, &self.migrated)
    }

    /// Migrated label set and no transitional label left behind.
    pub fn is_migrated(&self, labels: &BTreeMap<String, String>) -> bool {
        self.has_value(labels, &self.migrated)
            && !self.has(labels, &self.priority_new)
            && !self.has(labels, &self.dual)
    }

    /// Reset a node to the dual state. Returns true if labels changed.
    pub fn apply_dual(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let removed = labels.remove(&self.new_plugin).is_some();
        let previous = labels.insert(self.dual.clone(), self.value.clone());
        removed || previous.as_deref() != Some(self.value.as_str())
    }

    pub fn apply_rolled(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let previous = labels.insert(self.rolled.clone(), self.value.clone());
        previous.as_deref() != Some(self.value.as_str())
    }

    /// Hand CNI priority to the new plugin. Returns true if labels changed.
    pub fn apply_priority_new(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let removed = labels.remove(&self.priority_old).is_some();
        let previous = labels.insert(self.priority_new.clone(), self.value.clone());
        removed || previous.as_deref() != Some(self.value.as_str())
    }

    /// Switch the node to new-plugin only. Returns true if labels changed.
    pub fn apply_new_plugin(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let removed = labels.remove(&self.dual).is_some();
        let previous = labels.insert(self.new_plugin.clone(), self.value.clone());
        removed || previous.as_deref() != Some(self.value.as_str())
    }

    /// Set the final migrated label and clear every transitional one.
    pub fn apply_migrated(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let mut changed = labels.remove(&self.priority_new).is_some();
        changed |= labels.remove(&self.dual).is_some();
        let previous = labels.insert(self.migrated.clone(), self.value.clone());
        changed || previous.as_deref() != Some(self.value.as_str())
    }

    /// Every configured key, for duplicate detection.
    pub fn keys(&self) -> [&str; 6] {
        [
            self.dual.as_str(),
            self.new_plugin.as_str(),
            self.rolled.as_str(),
            self.priority_old.as_str(),
            self.priority_new.as_str(),
            self.migrated.as_str(),
        ]
    }
}

#[cfg(test)]
pub(crate) fn test_labels() -> Labels {
    Labels {
        dual: "node-role.kubernetes.io/canal-cilium".to_string(),
        new_plugin: "node-role.kubernetes.io/cilium".to_string(),
        rolled: "node-role.kubernetes.io/rolled".to_string(),
        priority_old: "node-role.kubernetes.io/cni-priority-canal".to_string(),
        priority_new: "node-role.kubernetes.io/cni-priority-cilium".to_string(),
        migrated: "node-role.kubernetes.io/migrated".to_string(),
        value: "true".to_string(),
    }
}
