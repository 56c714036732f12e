pub mod common;
pub mod sensor;
pub mod trigger;

pub use common::{Condition, Event, EventContext, SecretKeySelector, MEDIA_TYPE_JSON, MEDIA_TYPE_YAML};
pub use sensor::{
    node_id, Comparator, CycleStatus, DataFilter, DependencyGroup, EventContextFilter,
    EventDependency, EventDependencyFilter, ExprFilter, GroupType, JsonType, LogicalOperator,
    NodePhase, NodeStatus, NodeType, PayloadField, Sensor, SensorPhase, SensorSpec, SensorStatus,
    TimeFilter,
};
pub use trigger::{
    ArgoWorkflowOperation, ArgoWorkflowTrigger, ArtifactLocation, Backoff, BasicAuth,
    ConfigMapArtifact, FileArtifact, HttpTrigger, K8sOperation, K8sResourcePolicy, K8sTrigger,
    LogTrigger, NatsTrigger, OpenWhiskTrigger, ParameterOperation, RateLimit, RateLimitUnit,
    SlackTrigger, StatusPolicy, Trigger, TriggerKind, TriggerParameter, TriggerParameterSource, TriggerPolicy, TriggerTemplate,
    UrlArtifact,
};
