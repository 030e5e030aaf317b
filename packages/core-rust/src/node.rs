//! Node identities and per-node states.
//!
//! A content cluster consists of two node populations, distributors and
//! storage nodes, addressed by a zero-based index within their type. Both
//! self-reported states and controller-generated states use [`NodeState`];
//! only the fields that are part of the wire format are compared when deciding
//! whether a state has observably changed.
//!
//! # Compact form
//!
//! Events describe states in a compact human-readable form, e.g. `U`,
//! `D: Closed at other end`, `I, i 0.100 (read)` or `U, t 12345678`. The
//! strings are part of the operator-facing contract.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Distribution bit count assumed when nothing else is known.
pub const DEFAULT_DISTRIBUTION_BITS: u32 = 16;

/// Init progress at or below which a storage node is still listing buckets.
pub const LISTING_BUCKETS_INIT_PROGRESS_LIMIT: f64 = 0.01;

/// Slack used when comparing init progress against the listing-buckets limit.
const INIT_PROGRESS_EPSILON: f64 = 0.000_01;

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// The two node populations of a content cluster.
///
/// Type-specific policy (maintenance support, wire section names) lives here
/// rather than on per-type node objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Distributor,
    Storage,
}

impl NodeType {
    /// Both node types in wire section order.
    pub const ALL: [NodeType; 2] = [NodeType::Distributor, NodeType::Storage];

    /// Section name used in the wire format and in event prefixes.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            NodeType::Distributor => "distributor",
            NodeType::Storage => "storage",
        }
    }

    /// Parses a wire section name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "distributor" => Some(NodeType::Distributor),
            "storage" => Some(NodeType::Storage),
            _ => None,
        }
    }

    /// Only storage nodes can be placed in maintenance, either explicitly or
    /// implicitly while a lost contact is still within its transition window.
    #[must_use]
    pub fn supports_maintenance(self) -> bool {
        matches!(self, NodeType::Storage)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// Immutable address of a node: its type plus index.
///
/// Orders distributors before storage nodes, then by index, which matches the
/// section order of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub node_type: NodeType,
    pub index: u16,
}

impl NodeIdentity {
    #[must_use]
    pub fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    #[must_use]
    pub fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    #[must_use]
    pub fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    #[must_use]
    pub fn is_storage(&self) -> bool {
        self.node_type == NodeType::Storage
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Node state enumeration shared by reported, wanted and generated states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum State {
    Up,
    Down,
    Maintenance,
    Retired,
    Initializing,
    Stopping,
}

impl State {
    /// Lower-case letter used in the wire format.
    #[must_use]
    pub fn wire_letter(self) -> char {
        match self {
            State::Up => 'u',
            State::Down => 'd',
            State::Maintenance => 'm',
            State::Retired => 'r',
            State::Initializing => 'i',
            State::Stopping => 's',
        }
    }

    /// Upper-case letter used in the compact form.
    #[must_use]
    pub fn compact_letter(self) -> char {
        self.wire_letter().to_ascii_uppercase()
    }

    #[must_use]
    pub fn from_wire_letter(letter: &str) -> Option<Self> {
        match letter {
            "u" => Some(State::Up),
            "d" => Some(State::Down),
            "m" => Some(State::Maintenance),
            "r" => Some(State::Retired),
            "i" => Some(State::Initializing),
            "s" => Some(State::Stopping),
            _ => None,
        }
    }

    /// Rank for the "above" comparison. Maintenance ranks lowest so that a
    /// wanted maintenance overrides any reported state.
    fn rank(self) -> u8 {
        match self {
            State::Maintenance => 0,
            State::Down => 1,
            State::Stopping => 2,
            State::Initializing => 3,
            State::Retired => 4,
            State::Up => 5,
        }
    }

    /// Returns `true` if `self` is a strictly better state than `other`.
    #[must_use]
    pub fn above(self, other: State) -> bool {
        self.rank() > other.rank()
    }

    /// Up, Retired and Initializing nodes count towards availability.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, State::Up | State::Retired | State::Initializing)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Up => "Up",
            State::Down => "Down",
            State::Maintenance => "Maintenance",
            State::Retired => "Retired",
            State::Initializing => "Initializing",
            State::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// State of a single node, either as reported by the node itself or as
/// decided by the controller.
///
/// `description` is free text that never appears on the wire. `init_progress`
/// is only meaningful while `state` is [`State::Initializing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub state: State,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub init_progress: f64,
    #[serde(default)]
    pub start_timestamp: u64,
    #[serde(default = "default_bits")]
    pub min_used_bits: u32,
}

fn default_bits() -> u32 {
    DEFAULT_DISTRIBUTION_BITS
}

impl NodeState {
    #[must_use]
    pub fn new(state: State) -> Self {
        Self {
            state,
            description: String::new(),
            init_progress: 0.0,
            start_timestamp: 0,
            min_used_bits: DEFAULT_DISTRIBUTION_BITS,
        }
    }

    #[must_use]
    pub fn up() -> Self {
        Self::new(State::Up)
    }

    #[must_use]
    pub fn down() -> Self {
        Self::new(State::Down)
    }

    #[must_use]
    pub fn initializing(progress: f64) -> Self {
        Self::new(State::Initializing).with_init_progress(progress)
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_init_progress(mut self, progress: f64) -> Self {
        self.init_progress = progress;
        self
    }

    #[must_use]
    pub fn with_start_timestamp(mut self, start_timestamp: u64) -> Self {
        self.start_timestamp = start_timestamp;
        self
    }

    #[must_use]
    pub fn with_min_used_bits(mut self, bits: u32) -> Self {
        self.min_used_bits = bits;
        self
    }

    /// Returns `true` for a plain Up state with no auxiliary information,
    /// which is the implicit default inside a node section.
    #[must_use]
    pub fn is_default_up(&self) -> bool {
        self.state == State::Up
            && self.description.is_empty()
            && self.start_timestamp == 0
            && self.min_used_bits == DEFAULT_DISTRIBUTION_BITS
    }

    /// Returns `true` while an initializing node is still listing buckets.
    #[must_use]
    pub fn is_listing_buckets(&self) -> bool {
        self.state == State::Initializing
            && self.init_progress <= LISTING_BUCKETS_INIT_PROGRESS_LIMIT + INIT_PROGRESS_EPSILON
    }

    /// Equality of everything the wire format carries.
    #[must_use]
    pub fn wire_eq(&self, other: &NodeState) -> bool {
        if self.state != other.state
            || self.start_timestamp != other.start_timestamp
            || self.min_used_bits != other.min_used_bits
        {
            return false;
        }
        self.state != State::Initializing
            || self.init_progress.total_cmp(&other.init_progress) == Ordering::Equal
    }

    /// Equality that ignores init progress movement within the same init
    /// phase. Crossing the listing-buckets limit counts as a change.
    #[must_use]
    pub fn similar_to(&self, other: &NodeState) -> bool {
        if self.state != other.state
            || self.start_timestamp != other.start_timestamp
            || self.min_used_bits != other.min_used_bits
        {
            return false;
        }
        self.state != State::Initializing || self.is_listing_buckets() == other.is_listing_buckets()
    }

    /// Renders the compact form used in events.
    ///
    /// ```
    /// use fleetctl_core::{NodeState, NodeType};
    ///
    /// let state = NodeState::initializing(0.1);
    /// assert_eq!(state.compact(NodeType::Storage), "I, i 0.100 (read)");
    /// assert_eq!(state.compact(NodeType::Distributor), "I, i 0.100");
    /// ```
    #[must_use]
    pub fn compact(&self, node_type: NodeType) -> String {
        let mut out = String::new();
        out.push(self.state.compact_letter());
        if self.state == State::Initializing {
            out.push_str(", i ");
            out.push_str(&format_init_progress(self.init_progress));
            if node_type == NodeType::Storage {
                out.push_str(if self.is_listing_buckets() { " (ls)" } else { " (read)" });
            }
        }
        if self.start_timestamp != 0 {
            out.push_str(&format!(", t {}", self.start_timestamp));
        }
        if !self.description.is_empty() {
            out.push_str(": ");
            out.push_str(&self.description);
        }
        out
    }

    /// Compact form without the description, i.e. only what the wire carries.
    #[must_use]
    pub fn wire_compact(&self, node_type: NodeType) -> String {
        if self.description.is_empty() {
            return self.compact(node_type);
        }
        let mut bare = self.clone();
        bare.description.clear();
        bare.compact(node_type)
    }
}

/// Formats init progress with three significant digits; zero prints as `0.00`.
fn format_init_progress(progress: f64) -> String {
    if progress == 0.0 || !progress.is_finite() {
        return "0.00".to_string();
    }
    let scientific = format!("{progress:.2e}");
    let exponent = scientific
        .split_once('e')
        .and_then(|(_, exp)| exp.parse::<i32>().ok())
        .unwrap_or(0);
    let decimals = usize::try_from(2 - exponent).unwrap_or(0);
    format!("{progress:.decimals$}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
