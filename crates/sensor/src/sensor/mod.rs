//! The sensor engine: filters, dependency gates, node state, persistence and the
//! listener loop that ties them together.

pub mod expr;
pub mod filter;
pub mod gate;
pub mod listener;
pub mod persist;
pub mod state;
pub mod validate;
pub mod value_expr;
pub mod weight;

pub use gate::{Gates, TriggerGate};
pub use listener::{DependencyMatcher, Listener};
pub use persist::{persist_status, InMemoryStore, KubeSensorStore, SensorStore};
pub use state::{CycleOutcome, SensorState, Transition};
pub use validate::validate_sensor;
