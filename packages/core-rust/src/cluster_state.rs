//! Versioned cluster state and its wire text format.
//!
//! # Wire format
//!
//! A cluster state serializes to space-separated `key:value` tokens:
//!
//! ```text
//! version:6 cluster:d bits:15 distributor:10 .0.s:i .0.i:0.0 storage:10 .0.s:d
//! ```
//!
//! `cluster:` and `bits:` only appear when they differ from Up and 16. Each
//! node section (`distributor:<count>`, `storage:<count>`) is followed by
//! `.<index>.<field>:<value>` overrides for nodes that are not plainly Up.
//! Indices at or beyond a section's count are Down. Field codes are `s`
//! (state letter), `i` (init progress), `t` (start timestamp) and `c`
//! (min used bits). Unknown keys and node fields are skipped so newer writers
//! stay readable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::node::{NodeIdentity, NodeState, NodeType, State, DEFAULT_DISTRIBUTION_BITS};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from parsing the wire cluster-state format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterStateParseError {
    #[error("token '{token}' is not of the form key:value")]
    MalformedToken { token: String },
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("node override '{token}' appears before any node section")]
    OrphanNodeOverride { token: String },
    #[error("node index {index} is outside the {node_type} count {count}")]
    IndexOutOfRange {
        node_type: NodeType,
        index: u16,
        count: u16,
    },
}

static NODE_OVERRIDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.(\d+)\.([a-z]+)$").expect("static regex is valid"));

// ---------------------------------------------------------------------------
// ClusterState
// ---------------------------------------------------------------------------

/// Global cluster state: version, cluster-level Up/Down, distribution bits,
/// and the state of every node.
///
/// Only nodes that differ from the plain Up default are materialized. Down
/// nodes without a description at the tail of a section shrink its count, so
/// equal states always serialize identically.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterState {
    version: u32,
    state: State,
    distribution_bits: u32,
    distributor_count: u16,
    storage_count: u16,
    nodes: BTreeMap<NodeIdentity, NodeState>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::empty()
    }
}

impl ClusterState {
    /// Version 0, cluster Up, no nodes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            state: State::Up,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            distributor_count: 0,
            storage_count: 0,
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Cluster-level state, either [`State::Up`] or [`State::Down`].
    #[must_use]
    pub fn cluster_state(&self) -> State {
        self.state
    }

    pub fn set_cluster_state(&mut self, state: State) {
        self.state = state;
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state == State::Up
    }

    #[must_use]
    pub fn distribution_bits(&self) -> u32 {
        self.distribution_bits
    }

    pub fn set_distribution_bits(&mut self, bits: u32) {
        self.distribution_bits = bits;
    }

    #[must_use]
    pub fn node_count(&self, node_type: NodeType) -> u16 {
        match node_type {
            NodeType::Distributor => self.distributor_count,
            NodeType::Storage => self.storage_count,
        }
    }

    fn set_node_count(&mut self, node_type: NodeType, count: u16) {
        match node_type {
            NodeType::Distributor => self.distributor_count = count,
            NodeType::Storage => self.storage_count = count,
        }
    }

    /// Returns the state of a node. Nodes inside the section default to Up,
    /// nodes beyond it are Down.
    #[must_use]
    pub fn node_state(&self, node: NodeIdentity) -> NodeState {
        if node.index >= self.node_count(node.node_type) {
            return NodeState::down();
        }
        self.nodes.get(&node).cloned().unwrap_or_else(NodeState::up)
    }

    /// Sets a node's state, growing the section if needed.
    ///
    /// Indices skipped over while growing become Down. Setting a Down state
    /// trims undescribed Down nodes off the end of the section. The last
    /// index, `u16::MAX`, lies beyond the largest countable section and is
    /// ignored.
    pub fn set_node_state(&mut self, node: NodeIdentity, state: NodeState) {
        let count = self.node_count(node.node_type);
        if node.index >= count {
            let Some(new_count) = node.index.checked_add(1) else {
                tracing::warn!(node = %node, "node index beyond section limit, ignoring");
                return;
            };
            for index in count..node.index {
                self.nodes
                    .insert(NodeIdentity::new(node.node_type, index), NodeState::down());
            }
            self.set_node_count(node.node_type, new_count);
        }
        let is_down = state.state == State::Down;
        if state.is_default_up() {
            self.nodes.remove(&node);
        } else {
            self.nodes.insert(node, state);
        }
        if is_down {
            self.trim_trailing_down(node.node_type);
        }
    }

    fn trim_trailing_down(&mut self, node_type: NodeType) {
        let mut count = self.node_count(node_type);
        while count > 0 {
            let last = NodeIdentity::new(node_type, count - 1);
            match self.nodes.get(&last) {
                Some(ns) if ns.state == State::Down && ns.description.is_empty() => {
                    self.nodes.remove(&last);
                    count -= 1;
                }
                _ => break,
            }
        }
        self.set_node_count(node_type, count);
    }

    /// Iterates over every node inside the sections, including implicit Up
    /// nodes, in wire order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIdentity, NodeState)> + '_ {
        NodeType::ALL.into_iter().flat_map(move |node_type| {
            (0..self.node_count(node_type)).map(move |index| {
                let node = NodeIdentity::new(node_type, index);
                (node, self.node_state(node))
            })
        })
    }

    /// Compares two states ignoring version and init progress movement within
    /// an init phase. Two cluster-Down states are always similar, as node
    /// detail does not matter while the cluster as a whole is unavailable.
    #[must_use]
    pub fn similar_to(&self, other: &ClusterState) -> bool {
        if self.state != other.state {
            return false;
        }
        if self.state == State::Down {
            return true;
        }
        if self.distribution_bits != other.distribution_bits {
            return false;
        }
        NodeType::ALL.into_iter().all(|node_type| {
            let count = self.node_count(node_type).max(other.node_count(node_type));
            (0..count).all(|index| {
                let node = NodeIdentity::new(node_type, index);
                self.node_state(node).similar_to(&other.node_state(node))
            })
        })
    }

    /// Human-readable summary of what changed from `self` to `other`, e.g.
    /// `cluster: Up => Down, bits: 16 => 15, storage.2: U => D`.
    #[must_use]
    pub fn textual_difference(&self, other: &ClusterState) -> String {
        let mut parts = Vec::new();
        if self.state != other.state {
            parts.push(format!("cluster: {} => {}", self.state, other.state));
        }
        if self.distribution_bits != other.distribution_bits {
            parts.push(format!(
                "bits: {} => {}",
                self.distribution_bits, other.distribution_bits
            ));
        }
        for node_type in NodeType::ALL {
            let count = self.node_count(node_type).max(other.node_count(node_type));
            for index in 0..count {
                let node = NodeIdentity::new(node_type, index);
                let before = self.node_state(node);
                let after = other.node_state(node);
                if !before.wire_eq(&after) {
                    parts.push(format!(
                        "{node}: {} => {}",
                        before.wire_compact(node_type),
                        after.wire_compact(node_type)
                    ));
                }
            }
        }
        if parts.is_empty() {
            "no change".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ---------------------------------------------------------------------------
// Display / FromStr
// ---------------------------------------------------------------------------

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version:{}", self.version)?;
        if self.state != State::Up {
            write!(f, " cluster:{}", self.state.wire_letter())?;
        }
        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            write!(f, " bits:{}", self.distribution_bits)?;
        }
        for node_type in NodeType::ALL {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }
            write!(f, " {node_type}:{count}")?;
            for (node, ns) in self.nodes.range(
                NodeIdentity::new(node_type, 0)..NodeIdentity::new(node_type, count),
            ) {
                let index = node.index;
                if ns.state != State::Up {
                    write!(f, " .{index}.s:{}", ns.state.wire_letter())?;
                }
                if ns.state == State::Initializing {
                    write!(f, " .{index}.i:{:?}", ns.init_progress)?;
                }
                if ns.start_timestamp != 0 {
                    write!(f, " .{index}.t:{}", ns.start_timestamp)?;
                }
                if ns.min_used_bits != DEFAULT_DISTRIBUTION_BITS {
                    write!(f, " .{index}.c:{}", ns.min_used_bits)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ClusterStateParseError> {
    value.parse().map_err(|_| ClusterStateParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl FromStr for ClusterState {
    type Err = ClusterStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = ClusterState::empty();
        let mut section: Option<NodeType> = None;
        // Overrides are collected first so that trailing-Down trimming only
        // runs once the whole section is known.
        let mut overrides: BTreeMap<NodeIdentity, NodeState> = BTreeMap::new();

        for token in s.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                return Err(ClusterStateParseError::MalformedToken {
                    token: token.to_string(),
                });
            };

            if let Some(caps) = NODE_OVERRIDE_RE.captures(key) {
                let Some(node_type) = section else {
                    return Err(ClusterStateParseError::OrphanNodeOverride {
                        token: token.to_string(),
                    });
                };
                let index: u16 = parse_value(key, &caps[1])?;
                let count = state.node_count(node_type);
                if index >= count {
                    return Err(ClusterStateParseError::IndexOutOfRange {
                        node_type,
                        index,
                        count,
                    });
                }
                let node = NodeIdentity::new(node_type, index);
                let ns = overrides.entry(node).or_insert_with(NodeState::up);
                match &caps[2] {
                    "s" => {
                        ns.state = State::from_wire_letter(value).ok_or_else(|| {
                            ClusterStateParseError::InvalidValue {
                                key: key.to_string(),
                                value: value.to_string(),
                            }
                        })?;
                    }
                    "i" => ns.init_progress = parse_value(key, value)?,
                    "t" => ns.start_timestamp = parse_value(key, value)?,
                    "c" => ns.min_used_bits = parse_value(key, value)?,
                    field => tracing::debug!(field, "skipping unknown node field"),
                }
                continue;
            }

            match key {
                "version" => state.version = parse_value(key, value)?,
                "cluster" => {
                    state.state = match value {
                        "u" => State::Up,
                        "d" => State::Down,
                        _ => {
                            return Err(ClusterStateParseError::InvalidValue {
                                key: key.to_string(),
                                value: value.to_string(),
                            })
                        }
                    };
                }
                "bits" => state.distribution_bits = parse_value(key, value)?,
                _ => {
                    if let Some(node_type) = NodeType::from_name(key) {
                        let count: u16 = parse_value(key, value)?;
                        state.set_node_count(node_type, count);
                        section = Some(node_type);
                    } else {
                        tracing::debug!(key, "skipping unknown cluster state key");
                    }
                }
            }
        }

        for (node, ns) in overrides {
            state.set_node_state(node, ns);
        }
        for node_type in NodeType::ALL {
            state.trim_trailing_down(node_type);
        }
        Ok(state)
    }
}

impl Serialize for ClusterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn parse(s: &str) -> ClusterState {
        s.parse().expect("valid cluster state")
    }

    #[test]
    fn parses_and_formats_canonical_states() {
        for text in [
            "version:5 cluster:d distributor:10 .0.s:d storage:10",
            "version:4 bits:15 distributor:10 storage:10",
            "version:5 distributor:10 .0.t:12345678 storage:10 .0.s:m",
            "version:5 distributor:10 storage:10 .6.s:i .6.i:0.6",
            "version:6 distributor:10 .0.s:i .0.i:0.0 storage:10 .0.s:d",
        ] {
            assert_eq!(parse(text).to_string(), text);
        }
    }

    #[test]
    fn missing_version_defaults_to_zero() {
        let state = parse("distributor:3 storage:3 .0.s:d");
        assert_eq!(state.version(), 0);
        assert_eq!(state.node_state(NodeIdentity::storage(0)).state, State::Down);
        assert_eq!(state.node_state(NodeIdentity::storage(1)).state, State::Up);
        assert_eq!(state.to_string(), "version:0 distributor:3 storage:3 .0.s:d");
    }

    #[test]
    fn nodes_beyond_count_are_down() {
        let state = parse("distributor:2 storage:2");
        assert_eq!(state.node_state(NodeIdentity::storage(5)).state, State::Down);
    }

    #[test]
    fn trailing_down_without_description_shrinks_section() {
        let mut state = parse("distributor:3 storage:3");
        state.set_node_state(NodeIdentity::storage(2), NodeState::down());
        assert_eq!(state.node_count(NodeType::Storage), 2);

        state.set_node_state(
            NodeIdentity::storage(1),
            NodeState::down().with_description("Closed at other end"),
        );
        assert_eq!(state.node_count(NodeType::Storage), 2);
        assert_eq!(
            state.node_state(NodeIdentity::storage(1)).description,
            "Closed at other end"
        );
    }

    #[test]
    fn growing_section_fills_gaps_with_down() {
        let mut state = ClusterState::empty();
        state.set_node_state(NodeIdentity::distributor(2), NodeState::up());
        assert_eq!(state.node_count(NodeType::Distributor), 3);
        assert_eq!(state.to_string(), "version:0 distributor:3 .0.s:d .1.s:d");
    }

    #[test]
    fn last_node_index_is_ignored_instead_of_overflowing() {
        let mut state = parse("distributor:2 storage:2");
        state.set_node_state(
            NodeIdentity::storage(u16::MAX),
            NodeState::new(State::Maintenance),
        );
        assert_eq!(state.node_count(NodeType::Storage), 2);
        assert_eq!(state.to_string(), "version:0 distributor:2 storage:2");
    }

    #[test]
    fn node_override_keys_are_recognized() {
        assert!(NODE_OVERRIDE_RE.is_match(".12.s"));
        assert!(!NODE_OVERRIDE_RE.is_match("storage"));
        assert!(!NODE_OVERRIDE_RE.is_match(".x.s"));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let state = parse("version:3 future:1 distributor:2 .0.x:7 storage:2");
        assert_eq!(state.to_string(), "version:3 distributor:2 storage:2");
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            "version".parse::<ClusterState>(),
            Err(ClusterStateParseError::MalformedToken { .. })
        ));
        assert!(matches!(
            "version:x".parse::<ClusterState>(),
            Err(ClusterStateParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            ".0.s:d".parse::<ClusterState>(),
            Err(ClusterStateParseError::OrphanNodeOverride { .. })
        ));
        assert!(matches!(
            "storage:2 .4.s:d".parse::<ClusterState>(),
            Err(ClusterStateParseError::IndexOutOfRange { index: 4, .. })
        ));
        assert!(matches!(
            "storage:2 .0.s:q".parse::<ClusterState>(),
            Err(ClusterStateParseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn down_states_are_similar_regardless_of_nodes() {
        let a = parse("cluster:d distributor:10 storage:10 .2.s:d");
        let b = parse("cluster:d distributor:10 storage:10 .2.s:d .5.s:d");
        assert!(a.similar_to(&b));
        let c = parse("distributor:10 storage:10 .2.s:d");
        assert!(!a.similar_to(&c));
    }

    #[test]
    fn init_progress_within_phase_is_similar() {
        let a = parse("distributor:2 storage:2 .1.s:i .1.i:0.1");
        let b = parse("distributor:2 storage:2 .1.s:i .1.i:0.9");
        assert!(a.similar_to(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn textual_difference_lists_changes() {
        let a = parse("version:3 distributor:3 storage:3");
        let b = parse("version:4 cluster:d bits:15 distributor:3 storage:3 .2.s:m");
        assert_eq!(
            a.textual_difference(&b),
            "cluster: Up => Down, bits: 16 => 15, storage.2: U => M"
        );
        assert_eq!(a.textual_difference(&a), "no change");
    }

    #[test]
    fn serde_uses_wire_string() {
        let state = parse("version:7 distributor:2 storage:2 .1.s:r");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"version:7 distributor:2 storage:2 .1.s:r\"");
        let back: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    fn arb_node_state() -> impl Strategy<Value = NodeState> {
        prop_oneof![
            Just(NodeState::up()),
            Just(NodeState::down()),
            Just(NodeState::new(State::Maintenance)),
            Just(NodeState::new(State::Retired)),
            (0u32..=10).prop_map(|p| NodeState::initializing(f64::from(p) / 10.0)),
            (1u64..1_000_000).prop_map(|t| NodeState::up().with_start_timestamp(t)),
        ]
    }

    proptest! {
        #[test]
        fn formatted_state_parses_back_to_itself(
            version in 0u32..1000,
            down in any::<bool>(),
            nodes in proptest::collection::vec((any::<bool>(), 0u16..12, arb_node_state()), 0..20),
        ) {
            let mut state = ClusterState::empty();
            state.set_version(version);
            if down {
                state.set_cluster_state(State::Down);
            }
            for (is_storage, index, ns) in nodes {
                let node_type = if is_storage { NodeType::Storage } else { NodeType::Distributor };
                state.set_node_state(NodeIdentity::new(node_type, index), ns);
            }
            let text = state.to_string();
            let parsed: ClusterState = text.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), text);
        }
    }
}
