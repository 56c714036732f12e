use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::common::{Condition, Event};
use super::trigger::Trigger;

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "tripwire.io",
    version = "v1alpha1",
    kind = "Sensor",
    namespaced,
    status = "SensorStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
pub struct SensorSpec {
    /// Events the sensor waits for
    pub dependencies: Vec<EventDependency>,

    /// AND/OR aggregates over dependencies, usable in trigger conditions
    #[serde(rename = "dependencyGroups", default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_groups: Vec<DependencyGroup>,

    /// Actions fired when their conditions resolve
    pub triggers: Vec<Trigger>,

    /// Reset all nodes and listen again once every trigger has run
    #[serde(default = "default_true")]
    pub repeat: bool,

    /// Move the sensor to Error after a cycle in which a trigger failed
    #[serde(rename = "errorOnFailedRound", default)]
    pub error_on_failed_round: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct EventDependency {
    /// Unique name of the dependency within the sensor
    pub name: String,

    /// Event source to match, glob patterns allowed
    #[serde(rename = "eventSourceName")]
    pub event_source_name: String,

    /// Event name within the source, glob patterns allowed
    #[serde(rename = "eventName")]
    pub event_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<EventDependencyFilter>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct DependencyGroup {
    pub name: String,

    /// Names of the member dependencies
    pub dependencies: Vec<String>,

    #[serde(rename = "type", default)]
    pub group_type: GroupType,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum GroupType {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct EventDependencyFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContextFilter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataFilter>,

    /// Boolean expressions over named payload fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exprs: Vec<ExprFilter>,

    /// How several `exprs` combine, `and` when unset
    #[serde(rename = "exprLogicalOperator", default)]
    pub expr_logical_operator: LogicalOperator,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "and", alias = "&&")]
    And,
    #[serde(rename = "or", alias = "||")]
    Or,
}

/// `expr` is evaluated with every field bound to the payload value at its path, e.g.
/// `kind == "deploy" && replicas > 2`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ExprFilter {
    pub expr: String,
    pub fields: Vec<PayloadField>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct PayloadField {
    /// Dotted path into the payload
    pub path: String,
    /// Name the value is bound to in the expression
    pub name: String,
}

/// Wall-clock window of the day (UTC), `HH:MM:SS` or `HH:MM`. Start inclusive, stop exclusive.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct TimeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

/// Expected event context fields. Empty fields match anything.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct EventContextFilter {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,

    #[serde(rename = "typeVersion", default, skip_serializing_if = "String::is_empty")]
    pub type_version: String,

    #[serde(rename = "specversion", default, skip_serializing_if = "String::is_empty")]
    pub spec_version: String,

    #[serde(rename = "datacontenttype", default, skip_serializing_if = "String::is_empty")]
    pub data_content_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct DataFilter {
    /// Dotted path into the event payload
    pub path: String,

    #[serde(rename = "type")]
    pub value_type: JsonType,

    /// Accepted values; any one matching passes the predicate
    pub value: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparator: Option<Comparator>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Bool,
    Number,
    String,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum Comparator {
    #[default]
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct SensorStatus {
    pub phase: SensorPhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Node records keyed by node id
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(rename = "triggerCycleCount", default)]
    pub trigger_cycle_count: u64,

    #[serde(rename = "triggerCycleStatus", skip_serializing_if = "Option::is_none")]
    pub trigger_cycle_status: Option<CycleStatus>,

    #[serde(rename = "lastCycleTime", skip_serializing_if = "Option::is_none")]
    pub last_cycle_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum SensorPhase {
    #[default]
    New,
    Active,
    Complete,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum CycleStatus {
    Success,
    Failure,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum NodeType {
    EventDependency,
    DependencyGroup,
    Trigger,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum NodePhase {
    #[default]
    New,
    Active,
    Resolved,
    Complete,
    Error,
}

impl NodePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodePhase::Complete | NodePhase::Error)
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct NodeStatus {
    pub id: String,
    pub name: String,

    #[serde(rename = "displayName")]
    pub display_name: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    pub phase: NodePhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resolving event, dependency nodes only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,

    /// Event id sets this trigger already fired for in the current cycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprints: Vec<String>,

    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    #[serde(rename = "resolvedAt", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Deterministic node id for a node name: `{sensor}-{32 bit digest of name}`.
pub fn node_id(sensor_name: &str, node_name: &str) -> String {
    let digest = Sha256::digest(node_name.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{}-{}", sensor_name, hash)
}

fn default_true() -> bool {
    true
}
