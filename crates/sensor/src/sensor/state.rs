//! Node state machine over a sensor's in-memory status.
//!
//! Phases only move forward (`New < Active < Resolved < Complete`); any non-Error
//! node may move to `Error`; nothing leaves `Error` except [`SensorState::reset`].

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crd::{
    node_id, CycleStatus, Event, NodePhase, NodeStatus, NodeType, SensorPhase, SensorSpec,
    SensorStatus,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The node moved to a new phase
    Changed,
    /// Same phase, message/event/timestamps refreshed
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nodes reset, the sensor keeps listening
    Reset,
    /// Sensor is done and ignores further events
    Completed,
    /// A trigger failed and the sensor stops
    Failed,
}

fn rank(phase: NodePhase) -> u8 {
    match phase {
        NodePhase::New => 0,
        NodePhase::Active => 1,
        NodePhase::Resolved => 2,
        NodePhase::Complete => 3,
        NodePhase::Error => 4,
    }
}

fn transition_allowed(from: NodePhase, to: NodePhase) -> bool {
    match (from, to) {
        (NodePhase::Error, _) => false,
        (_, NodePhase::Error) => true,
        (from, to) => rank(to) > rank(from),
    }
}

#[derive(Debug, Clone)]
pub struct SensorState {
    sensor: String,
    status: SensorStatus,
}

impl SensorState {
    pub fn new(sensor: impl Into<String>, status: SensorStatus) -> Self {
        Self {
            sensor: sensor.into(),
            status,
        }
    }

    pub fn sensor_name(&self) -> &str {
        &self.sensor
    }

    pub fn status(&self) -> &SensorStatus {
        &self.status
    }

    pub fn phase(&self) -> SensorPhase {
        self.status.phase
    }

    /// Whether events should still be processed.
    pub fn is_listening(&self) -> bool {
        matches!(self.status.phase, SensorPhase::New | SensorPhase::Active)
    }

    pub fn set_phase(&mut self, phase: SensorPhase, message: Option<String>) {
        if self.status.phase != phase {
            info!(sensor = %self.sensor, from = ?self.status.phase, to = ?phase, "sensor phase changed");
        }
        self.status.phase = phase;
        self.status.message = message;
    }

    /// Create a node for every dependency, group and trigger that lacks one, drop nodes
    /// no longer declared, and activate the sensor.
    pub fn initialize(&mut self, spec: &SensorSpec) {
        let declared: Vec<(&str, NodeType)> = spec
            .dependencies
            .iter()
            .map(|d| (d.name.as_str(), NodeType::EventDependency))
            .chain(
                spec.dependency_groups
                    .iter()
                    .map(|g| (g.name.as_str(), NodeType::DependencyGroup)),
            )
            .chain(
                spec.triggers
                    .iter()
                    .map(|t| (t.template.name.as_str(), NodeType::Trigger)),
            )
            .collect();

        let ids: HashSet<String> = declared
            .iter()
            .map(|(name, _)| node_id(&self.sensor, name))
            .collect();
        self.status.nodes.retain(|id, node| {
            let keep = ids.contains(id);
            if !keep {
                debug!(node = %node.name, "dropping node no longer declared");
            }
            keep
        });

        for (name, node_type) in declared {
            self.initialize_node(name, node_type);
        }

        for node in self.status.nodes.values_mut() {
            if node.phase == NodePhase::New {
                node.phase = NodePhase::Active;
                node.updated_at = Utc::now();
            }
        }

        if self.status.phase == SensorPhase::New {
            self.set_phase(SensorPhase::Active, None);
        }
    }

    fn initialize_node(&mut self, name: &str, node_type: NodeType) {
        let id = node_id(&self.sensor, name);
        if self.status.nodes.contains_key(&id) {
            return;
        }
        let now = Utc::now();
        info!(sensor = %self.sensor, node = %name, node_type = ?node_type, "initializing node");
        self.status.nodes.insert(
            id.clone(),
            NodeStatus {
                id,
                name: name.to_string(),
                display_name: name.to_string(),
                node_type,
                phase: NodePhase::New,
                message: None,
                event: None,
                fingerprints: Vec::new(),
                started_at: now,
                updated_at: now,
                resolved_at: None,
                completed_at: None,
            },
        );
    }

    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(&node_id(&self.sensor, name))
    }

    pub fn node_phase(&self, name: &str) -> Option<NodePhase> {
        self.node(name).map(|n| n.phase)
    }

    /// Move a node to `phase`. Re-marking the current phase only refreshes the message,
    /// event and timestamps.
    pub fn mark_node_phase(
        &mut self,
        name: &str,
        phase: NodePhase,
        event: Option<Event>,
        message: Option<String>,
    ) -> Result<Transition> {
        let id = node_id(&self.sensor, name);
        let node = self
            .status
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node '{}'", name)))?;

        let transition = if node.phase == phase {
            Transition::Refreshed
        } else if transition_allowed(node.phase, phase) {
            info!(
                sensor = %self.sensor,
                node = %name,
                from = %node.phase,
                to = %phase,
                "marking node phase"
            );
            node.phase = phase;
            Transition::Changed
        } else {
            warn!(sensor = %self.sensor, node = %name, from = %node.phase, to = %phase, "refusing phase regression");
            return Err(Error::Internal(format!(
                "illegal transition of node '{}' from {} to {}",
                name, node.phase, phase
            )));
        };

        let now = Utc::now();
        node.updated_at = now;
        if let Some(message) = message {
            node.message = Some(message);
        }
        if node.node_type == NodeType::EventDependency {
            if let Some(event) = event {
                node.event = Some(event);
            }
        }
        if phase == NodePhase::Resolved {
            node.resolved_at = Some(now);
        }
        if phase.is_terminal() && node.completed_at.is_none() {
            node.completed_at = Some(now);
        }

        Ok(transition)
    }

    /// Resolved events keyed by dependency name.
    pub fn resolved_events(&self) -> HashMap<String, Event> {
        self.status
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::EventDependency && n.phase == NodePhase::Resolved)
            .filter_map(|n| n.event.clone().map(|e| (n.name.clone(), e)))
            .collect()
    }

    pub fn resolved_names(&self) -> HashSet<String> {
        self.status
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::EventDependency && n.phase == NodePhase::Resolved)
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn has_fingerprint(&self, trigger: &str, fingerprint: &str) -> bool {
        self.node(trigger)
            .map(|n| n.fingerprints.iter().any(|f| f == fingerprint))
            .unwrap_or(false)
    }

    pub fn record_fingerprint(&mut self, trigger: &str, fingerprint: String) {
        let id = node_id(&self.sensor, trigger);
        if let Some(node) = self.status.nodes.get_mut(&id) {
            if !node.fingerprints.contains(&fingerprint) {
                node.fingerprints.push(fingerprint);
            }
        }
    }

    fn trigger_nodes(&self) -> impl Iterator<Item = &NodeStatus> {
        self.status
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Trigger)
    }

    /// Every trigger has run to a terminal phase.
    pub fn cycle_done(&self) -> bool {
        let mut triggers = self.trigger_nodes().peekable();
        triggers.peek().is_some() && self.trigger_nodes().all(|n| n.phase.is_terminal())
    }

    /// Record a finished cycle and move the sensor on according to its repeat and
    /// failed-round settings.
    pub fn finish_cycle(&mut self, repeat: bool, error_on_failed_round: bool) -> CycleOutcome {
        let failed: Vec<String> = self
            .trigger_nodes()
            .filter(|n| n.phase == NodePhase::Error)
            .map(|n| n.name.clone())
            .collect();

        self.status.trigger_cycle_count += 1;
        self.status.last_cycle_time = Some(Utc::now());
        self.status.trigger_cycle_status = Some(if failed.is_empty() {
            CycleStatus::Success
        } else {
            CycleStatus::Failure
        });
        info!(
            sensor = %self.sensor,
            cycle = self.status.trigger_cycle_count,
            failed = failed.len(),
            "trigger cycle finished"
        );

        if !failed.is_empty() && error_on_failed_round {
            self.set_phase(
                SensorPhase::Error,
                Some(format!("triggers failed: {}", failed.join(", "))),
            );
            return CycleOutcome::Failed;
        }

        if repeat {
            self.reset();
            CycleOutcome::Reset
        } else {
            self.set_phase(SensorPhase::Complete, None);
            CycleOutcome::Completed
        }
    }

    /// Return every node to `New`, dropping resolved events and fingerprints.
    pub fn reset(&mut self) {
        let now = Utc::now();
        for node in self.status.nodes.values_mut() {
            node.phase = NodePhase::New;
            node.message = None;
            node.event = None;
            node.fingerprints.clear();
            node.updated_at = now;
            node.resolved_at = None;
            node.completed_at = None;
        }
        debug!(sensor = %self.sensor, "nodes reset");
    }
}
