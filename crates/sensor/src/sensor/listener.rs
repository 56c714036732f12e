//! The listener loop: events in, triggers out.
//!
//! A dispatcher matches each event to dependencies and shards the work across filter
//! workers by dependency name, so events for one dependency stay in arrival order. The
//! workers hand accepted events to a single actor that owns the sensor state, evaluates
//! the trigger gates and runs triggers concurrently in a `JoinSet`. Every state change
//! is persisted before the next message is handled.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::filter;
use super::gate::{fingerprint, Gates};
use super::persist::{persist_status, SensorStore};
use super::state::{CycleOutcome, SensorState};
use super::validate::validate_sensor;
use super::weight::{bucket_for, select_weighted};
use crate::crd::{Event, EventDependencyFilter, NodePhase, Sensor, SensorPhase, SensorStatus};
use crate::metrics::{
    EVENTS_RECEIVED_TOTAL, EVENTS_REJECTED_TOTAL, FILTER_ERRORS_TOTAL, PERSISTENCE_FAILURES_TOTAL,
    TRIGGERS_FAILED_TOTAL, TRIGGERS_SUCCEEDED_TOTAL,
};
use crate::triggers::backoff::BackoffSchedule;
use crate::triggers::{run_trigger, EventMap, TriggerOutput, TriggerRegistry};
use crate::{Error, Result};

/// An event that passed a dependency's filters.
#[derive(Debug)]
struct Resolution {
    dependency: String,
    event: Event,
}

/// A spawned trigger run and the fingerprint it fired for.
struct TriggerRun {
    trigger: String,
    fingerprint: String,
}

/// Maps events to the dependencies whose event source and event name globs match.
pub struct DependencyMatcher {
    dependencies: Vec<(String, GlobMatcher, GlobMatcher)>,
}

impl DependencyMatcher {
    pub fn new(sensor: &Sensor) -> Result<Self> {
        let compile = |pattern: &str| {
            Glob::new(pattern)
                .map(|g| g.compile_matcher())
                .map_err(|e| Error::Validation(format!("invalid pattern '{}': {}", pattern, e)))
        };
        let dependencies = sensor
            .spec
            .dependencies
            .iter()
            .map(|d| {
                Ok((
                    d.name.clone(),
                    compile(&d.event_source_name)?,
                    compile(&d.event_name)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dependencies })
    }

    pub fn matching<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a str> + 'a {
        self.dependencies
            .iter()
            .filter(move |(_, source, name)| {
                source.is_match(&event.context.source) && name.is_match(&event.context.subject)
            })
            .map(|(dep, _, _)| dep.as_str())
    }
}

fn shard_for(dependency: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    dependency.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

pub struct Listener {
    sensor: Arc<Sensor>,
    registry: Arc<TriggerRegistry>,
    store: Arc<dyn SensorStore>,
    persist_schedule: BackoffSchedule,
    workers: usize,
}

impl Listener {
    pub fn new(
        sensor: Sensor,
        registry: Arc<TriggerRegistry>,
        store: Arc<dyn SensorStore>,
        persist_schedule: BackoffSchedule,
        workers: usize,
    ) -> Self {
        Self {
            sensor: Arc::new(sensor),
            registry,
            store,
            persist_schedule,
            workers: workers.max(1),
        }
    }

    /// Consume events until the channel closes or `cancel` fires, returning the final
    /// status. An invalid sensor is persisted in the `Error` phase and returned as an
    /// error without consuming any event.
    pub async fn run(
        self,
        events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) -> Result<SensorStatus> {
        let name = self.sensor.name_any();
        let (status, _) = self.store.get(&name).await?;
        let mut actor = Actor {
            state: SensorState::new(name.clone(), status),
            sensor: self.sensor.clone(),
            gates: None,
            registry: self.registry.clone(),
            store: self.store.clone(),
            persist_schedule: self.persist_schedule.clone(),
            in_flight: HashMap::new(),
            running: JoinSet::new(),
            tasks: HashMap::new(),
            cancel: cancel.child_token(),
        };

        let (gates, matcher) = match validate_sensor(&self.sensor)
            .and_then(|gates| Ok((gates, DependencyMatcher::new(&self.sensor)?)))
        {
            Ok(compiled) => compiled,
            Err(e) => {
                error!(sensor = %name, error = %e, "sensor is invalid");
                actor.state.set_phase(SensorPhase::Error, Some(e.to_string()));
                actor.persist().await;
                return Err(e);
            }
        };
        actor.gates = Some(gates);
        actor.state.initialize(&self.sensor.spec);
        info!(sensor = %name, phase = ?actor.state.phase(), "sensor listening");

        // events recorded before a restart may already satisfy a gate
        actor.evaluate_triggers();
        actor.persist().await;

        let (resolved_tx, resolved_rx) = mpsc::channel(self.workers * 64);
        let filters: Arc<HashMap<String, Option<EventDependencyFilter>>> = Arc::new(
            self.sensor
                .spec
                .dependencies
                .iter()
                .map(|d| (d.name.clone(), d.filters.clone()))
                .collect(),
        );

        let mut shards = Vec::with_capacity(self.workers);
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let (tx, rx) = mpsc::channel(64);
            shards.push(tx);
            workers.spawn(filter_worker(worker, rx, filters.clone(), resolved_tx.clone()));
        }
        drop(resolved_tx);
        workers.spawn(dispatch(events, matcher, shards, cancel.clone()));

        let status = actor.run(resolved_rx, cancel).await;
        workers.shutdown().await;
        Ok(status)
    }
}

async fn dispatch(
    mut events: mpsc::Receiver<Event>,
    matcher: DependencyMatcher,
    shards: Vec<mpsc::Sender<(String, Event)>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        EVENTS_RECEIVED_TOTAL.inc();

        let mut matched = false;
        for dependency in matcher.matching(&event) {
            matched = true;
            let shard = &shards[shard_for(dependency, shards.len())];
            if shard.send((dependency.to_string(), event.clone())).await.is_err() {
                return;
            }
        }
        if !matched {
            debug!(
                event_id = %event.context.id,
                source = %event.context.source,
                subject = %event.context.subject,
                "event matches no dependency"
            );
        }
    }
    debug!("event dispatcher stopped");
}

async fn filter_worker(
    worker: usize,
    mut rx: mpsc::Receiver<(String, Event)>,
    filters: Arc<HashMap<String, Option<EventDependencyFilter>>>,
    resolved: mpsc::Sender<Resolution>,
) {
    while let Some((dependency, event)) = rx.recv().await {
        let filter = filters.get(&dependency).and_then(Option::as_ref);
        match filter::accept(filter, &event) {
            Ok(true) => {
                debug!(worker, dependency = %dependency, event_id = %event.context.id, "event accepted");
                if resolved.send(Resolution { dependency, event }).await.is_err() {
                    return;
                }
            }
            Ok(false) => {
                debug!(worker, dependency = %dependency, event_id = %event.context.id, "event rejected by filters");
                EVENTS_REJECTED_TOTAL.with_label_values(&[&dependency]).inc();
            }
            Err(e) => {
                warn!(worker, dependency = %dependency, event_id = %event.context.id, error = %e, "failed to evaluate filters");
                FILTER_ERRORS_TOTAL.with_label_values(&[&dependency]).inc();
            }
        }
    }
}

/// Single owner of the sensor state.
struct Actor {
    state: SensorState,
    sensor: Arc<Sensor>,
    gates: Option<Gates>,
    registry: Arc<TriggerRegistry>,
    store: Arc<dyn SensorStore>,
    persist_schedule: BackoffSchedule,
    /// Trigger name to the fingerprint it is running for
    in_flight: HashMap<String, String>,
    running: JoinSet<Result<TriggerOutput>>,
    tasks: HashMap<task::Id, TriggerRun>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut resolved: mpsc::Receiver<Resolution>, cancel: CancellationToken) -> SensorStatus {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(sensor = %self.state.sensor_name(), "shutting down listener");
                    self.cancel.cancel();
                    break;
                }
                Some(joined) = self.running.join_next_with_id(), if !self.running.is_empty() => {
                    self.on_joined(joined);
                    self.persist().await;
                }
                message = resolved.recv() => match message {
                    Some(resolution) => {
                        self.on_resolved(resolution);
                        self.persist().await;
                    }
                    None => break,
                },
            }
        }

        // let in-flight triggers finish, or observe the cancellation
        while let Some(joined) = self.running.join_next_with_id().await {
            self.on_joined(joined);
        }
        self.persist().await;
        self.state.status().clone()
    }

    async fn persist(&self) {
        let name = self.state.sensor_name();
        if let Err(e) = persist_status(
            self.store.as_ref(),
            name,
            self.state.status(),
            &self.persist_schedule,
            &CancellationToken::new(),
        )
        .await
        {
            error!(sensor = %name, error = %e, "failed to persist sensor status");
            PERSISTENCE_FAILURES_TOTAL.inc();
        }
    }

    fn on_resolved(&mut self, resolution: Resolution) {
        let Resolution { dependency, event } = resolution;
        if !self.state.is_listening() {
            debug!(sensor = %self.state.sensor_name(), dependency = %dependency, "sensor is not listening, ignoring event");
            return;
        }
        if let Err(e) = self
            .state
            .mark_node_phase(&dependency, NodePhase::Resolved, Some(event), None)
        {
            warn!(dependency = %dependency, error = %e, "failed to resolve dependency");
            return;
        }

        if let Some(gates) = &self.gates {
            let resolved = self.state.resolved_names();
            for group in gates.resolved_groups(&resolved) {
                if let Err(e) = self.state.mark_node_phase(&group, NodePhase::Resolved, None, None) {
                    warn!(group = %group, error = %e, "failed to resolve dependency group");
                }
            }
        }
        self.evaluate_triggers();
    }

    /// Fire every trigger whose gate holds for a set of events it has not fired for yet.
    ///
    /// Weighted triggers form one group that fires at most one member per cycle. The
    /// member is chosen from a bucket over the events resolved for the whole group, and
    /// only once the chosen member's gate holds; the other members are then skipped.
    fn evaluate_triggers(&mut self) {
        if !self.state.is_listening() {
            return;
        }
        let Some(gates) = &self.gates else {
            return;
        };
        let sensor = self.sensor.clone();
        let resolved = self.state.resolved_names();
        let events = self.state.resolved_events();
        let weighted: Vec<(&str, u32)> = sensor
            .spec
            .triggers
            .iter()
            .filter(|t| t.weight > 0)
            .map(|t| (t.template.name.as_str(), t.weight))
            .collect();

        let mut selected = None;
        let mut unowned = None;
        let decided = weighted.iter().any(|(name, _)| {
            self.in_flight.contains_key(*name)
                || self.state.node(name).is_some_and(|n| !n.fingerprints.is_empty())
        });
        if !weighted.is_empty() && !decided {
            let ids: Vec<&str> = gates
                .triggers()
                .iter()
                .filter(|g| weighted.iter().any(|(name, _)| *name == g.trigger))
                .flat_map(|g| g.dependencies.iter())
                .filter_map(|d| events.get(d))
                .map(|e| e.context.id.as_str())
                .collect();
            let bucket = bucket_for(ids);
            let weights: Vec<u32> = weighted.iter().map(|(_, w)| *w).collect();
            match select_weighted(&weights, bucket) {
                Some(position) => selected = Some(weighted[position].0),
                None => unowned = Some(bucket),
            }
        }

        let mut fire = Vec::new();
        let mut skipped = Vec::new();
        for (index, gate) in gates.triggers().iter().enumerate() {
            let trigger = gate.trigger.as_str();
            let is_weighted = weighted.iter().any(|(name, _)| *name == trigger);
            if (is_weighted && selected != Some(trigger))
                || self.in_flight.contains_key(trigger)
                || self.state.node_phase(trigger) == Some(NodePhase::Error)
                || !gates.evaluate(gate, &resolved)
            {
                continue;
            }
            let ids: Vec<&str> = gate
                .dependencies
                .iter()
                .filter_map(|d| events.get(d))
                .map(|e| e.context.id.as_str())
                .collect();
            let fp = fingerprint(ids);
            if self.state.has_fingerprint(trigger, &fp) {
                continue;
            }

            if is_weighted {
                skipped = weighted
                    .iter()
                    .map(|(name, _)| *name)
                    .filter(|name| *name != trigger)
                    .filter(|name| !self.state.node_phase(name).is_some_and(|p| p.is_terminal()))
                    .map(str::to_string)
                    .collect();
            }
            fire.push((index, fp));
        }

        if let Some(bucket) = unowned {
            for (name, _) in &weighted {
                if self.state.node_phase(name).is_some_and(|p| p.is_terminal()) {
                    continue;
                }
                error!(trigger = %name, bucket, "no weighted trigger owns the event bucket");
                if let Err(e) = self.state.mark_node_phase(
                    name,
                    NodePhase::Error,
                    None,
                    Some(format!("no weighted trigger owns bucket {}", bucket)),
                ) {
                    warn!(trigger = %name, error = %e, "failed to mark weighted trigger");
                }
            }
        }
        for trigger in skipped {
            debug!(trigger = %trigger, "trigger not selected by weight");
            if let Err(e) = self.state.mark_node_phase(
                &trigger,
                NodePhase::Complete,
                None,
                Some("skipped, another weighted trigger was selected".to_string()),
            ) {
                warn!(trigger = %trigger, error = %e, "failed to mark skipped trigger");
            }
        }
        if fire.is_empty() {
            self.finish_cycle_if_done();
        }

        for (index, fp) in fire {
            let spec = sensor.spec.triggers[index].clone();
            let trigger = spec.template.name.clone();
            self.activate(&trigger);
            info!(sensor = %self.state.sensor_name(), trigger = %trigger, "firing trigger");
            self.in_flight.insert(trigger.clone(), fp.clone());

            let registry = self.registry.clone();
            let cancel = self.cancel.clone();
            let events: EventMap = events.clone();
            let handle = self
                .running
                .spawn(async move { run_trigger(&registry, &spec, &events, &cancel).await });
            self.tasks.insert(
                handle.id(),
                TriggerRun {
                    trigger,
                    fingerprint: fp,
                },
            );
        }
    }

    fn activate(&mut self, trigger: &str) {
        if self.state.node_phase(trigger) == Some(NodePhase::New) {
            if let Err(e) = self.state.mark_node_phase(trigger, NodePhase::Active, None, None) {
                warn!(trigger = %trigger, error = %e, "failed to activate trigger");
            }
        }
    }

    fn on_joined(&mut self, joined: std::result::Result<(task::Id, Result<TriggerOutput>), JoinError>) {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                let result = if e.is_panic() {
                    Err(Error::Internal(format!("trigger execution panicked: {}", e)))
                } else {
                    Err(Error::Cancelled)
                };
                (e.id(), result)
            }
        };
        let Some(TriggerRun {
            trigger,
            fingerprint,
        }) = self.tasks.remove(&id)
        else {
            error!(task = %id, "finished trigger task is not tracked");
            return;
        };
        self.in_flight.remove(&trigger);

        let marked = match result {
            Ok(output) => {
                debug!(trigger = %trigger, output = ?output, "trigger succeeded");
                TRIGGERS_SUCCEEDED_TOTAL.with_label_values(&[&trigger]).inc();
                self.state.record_fingerprint(&trigger, fingerprint);
                self.state.mark_node_phase(&trigger, NodePhase::Complete, None, None)
            }
            Err(Error::Cancelled) => {
                info!(trigger = %trigger, "trigger cancelled, leaving it active");
                return;
            }
            Err(e) => {
                error!(trigger = %trigger, error = %e, "trigger failed");
                TRIGGERS_FAILED_TOTAL.with_label_values(&[&trigger]).inc();
                self.state.record_fingerprint(&trigger, fingerprint);
                self.state
                    .mark_node_phase(&trigger, NodePhase::Error, None, Some(e.to_string()))
            }
        };
        if let Err(e) = marked {
            warn!(trigger = %trigger, error = %e, "failed to record trigger outcome");
        }

        self.finish_cycle_if_done();
    }

    fn finish_cycle_if_done(&mut self) {
        if !self.in_flight.is_empty() || !self.state.cycle_done() {
            return;
        }
        let spec = &self.sensor.spec;
        match self.state.finish_cycle(spec.repeat, spec.error_on_failed_round) {
            CycleOutcome::Reset => debug!("waiting for the next cycle"),
            CycleOutcome::Completed => info!(sensor = %self.state.sensor_name(), "sensor completed"),
            CycleOutcome::Failed => warn!(sensor = %self.state.sensor_name(), "sensor stopped after a failed round"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_sensor;
    use crate::crd::common::tests::event;
    use crate::crd::NodeType;
    use crate::secrets::SecretReader;
    use crate::sensor::persist::InMemoryStore;
    use crate::triggers::{ClientCache, TriggerEnv};
    use std::time::Duration;

    fn sensor(yaml: &str) -> Sensor {
        parse_sensor(yaml.as_bytes()).unwrap()
    }

    fn listener(sensor: Sensor, store: Arc<InMemoryStore>) -> Listener {
        let registry = TriggerRegistry::new(
            TriggerEnv::new(sensor.name_any(), "default", None, SecretReader::new("/nonexistent")),
            Arc::new(ClientCache::new()),
        );
        Listener::new(
            sensor,
            Arc::new(registry),
            store,
            BackoffSchedule::new(Duration::from_millis(1), 2.0, 0.0, 3),
            2,
        )
    }

    const TWO_DEPS: &str = r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: two-deps
spec:
  repeat: false
  dependencies:
    - name: dep1
      eventSourceName: webhook
      eventName: one
    - name: dep2
      eventSourceName: webhook
      eventName: two
  triggers:
    - template:
        name: log-it
        log: {}
"#;

    fn trigger_phase(status: &SensorStatus, name: &str) -> Option<NodePhase> {
        status
            .nodes
            .values()
            .find(|n| n.node_type == NodeType::Trigger && n.name == name)
            .map(|n| n.phase)
    }

    #[test]
    fn test_matcher_uses_globs() {
        let mut sensor = sensor(TWO_DEPS);
        sensor.spec.dependencies[1].event_name = "t*".to_string();
        let matcher = DependencyMatcher::new(&sensor).unwrap();
        let evt = event("1", "webhook", "two", "{}");
        assert_eq!(matcher.matching(&evt).collect::<Vec<_>>(), vec!["dep2"]);
        let evt = event("2", "calendar", "one", "{}");
        assert_eq!(matcher.matching(&evt).count(), 0);
    }

    #[test]
    fn test_shards_are_stable() {
        assert_eq!(shard_for("dep1", 4), shard_for("dep1", 4));
        assert!(shard_for("dep1", 4) < 4);
    }

    #[tokio::test]
    async fn test_one_dependency_does_not_fire() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        tx.send(event("1", "webhook", "one", "{}")).await.unwrap();
        drop(tx);
        let status = listener(sensor(TWO_DEPS), store)
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(trigger_phase(&status, "log-it"), Some(NodePhase::Active));
        assert_eq!(status.trigger_cycle_count, 0);
    }

    #[tokio::test]
    async fn test_both_dependencies_fire_once_and_complete() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        tx.send(event("1", "webhook", "one", "{}")).await.unwrap();
        tx.send(event("2", "webhook", "two", "{}")).await.unwrap();
        drop(tx);
        let status = listener(sensor(TWO_DEPS), store.clone())
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.phase, SensorPhase::Complete);
        assert_eq!(status.trigger_cycle_count, 1);
        assert_eq!(trigger_phase(&status, "log-it"), Some(NodePhase::Complete));

        let stored = store.status("two-deps").await.unwrap();
        assert_eq!(stored, status);
    }

    #[tokio::test]
    async fn test_invalid_sensor_is_persisted_in_error() {
        let store = Arc::new(InMemoryStore::new());
        let mut invalid = sensor(TWO_DEPS);
        invalid.spec.triggers[0].conditions = Some("dep1 && nope".to_string());
        let (_tx, rx) = mpsc::channel(1);
        let result = listener(invalid, store.clone())
            .run(rx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        let stored = store.status("two-deps").await.unwrap();
        assert_eq!(stored.phase, SensorPhase::Error);
    }

    #[tokio::test]
    async fn test_cancellation_stops_listening() {
        let store = Arc::new(InMemoryStore::new());
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let status = listener(sensor(TWO_DEPS), store)
            .run(rx, cancel)
            .await
            .unwrap();
        assert_eq!(status.phase, SensorPhase::Active);
    }

    #[tokio::test]
    async fn test_failed_round_stops_sensor() {
        let yaml = r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: failing
spec:
  errorOnFailedRound: true
  dependencies:
    - name: dep1
      eventSourceName: webhook
      eventName: one
  triggers:
    - template:
        name: lambda
        awsLambda:
          functionName: f
"#;
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        tx.send(event("1", "webhook", "one", "{}")).await.unwrap();
        drop(tx);
        let status = listener(sensor(yaml), store).run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(status.phase, SensorPhase::Error);
        assert_eq!(trigger_phase(&status, "lambda"), Some(NodePhase::Error));
    }

    #[tokio::test]
    async fn test_weighted_triggers_fire_exactly_one() {
        let yaml = r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: canary
spec:
  repeat: false
  dependencies:
    - name: dep1
      eventSourceName: webhook
      eventName: one
  triggers:
    - weight: 30
      template:
        name: canary
        log: {}
    - weight: 70
      template:
        name: stable
        log: {}
"#;
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        tx.send(event("evt-42", "webhook", "one", "{}")).await.unwrap();
        drop(tx);
        let status = listener(sensor(yaml), store).run(rx, CancellationToken::new()).await.unwrap();

        let skipped = status
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Trigger && n.message.is_some())
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(status.phase, SensorPhase::Complete);
    }

    #[tokio::test]
    async fn test_weighted_triggers_with_different_gates_fire_one() {
        let yaml = r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: split
spec:
  repeat: false
  dependencies:
    - name: dep1
      eventSourceName: webhook
      eventName: one
    - name: dep2
      eventSourceName: webhook
      eventName: two
  triggers:
    - weight: 50
      conditions: dep1
      template:
        name: first
        log: {}
    - weight: 50
      conditions: dep2
      template:
        name: second
        log: {}
"#;
        for round in 0..8 {
            let store = Arc::new(InMemoryStore::new());
            let (tx, rx) = mpsc::channel(8);
            tx.send(event(&format!("a-{}", round), "webhook", "one", "{}")).await.unwrap();
            tx.send(event(&format!("b-{}", round), "webhook", "two", "{}")).await.unwrap();
            drop(tx);
            let status = listener(sensor(yaml), store).run(rx, CancellationToken::new()).await.unwrap();

            let triggers: Vec<_> = status
                .nodes
                .values()
                .filter(|n| n.node_type == NodeType::Trigger)
                .collect();
            assert!(triggers.iter().all(|n| n.phase == NodePhase::Complete));
            assert_eq!(triggers.iter().filter(|n| !n.fingerprints.is_empty()).count(), 1);
            assert_eq!(triggers.iter().filter(|n| n.message.is_some()).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_weights_leaving_a_gap_are_rejected() {
        let mut sensor = sensor(TWO_DEPS);
        let mut second = sensor.spec.triggers[0].clone();
        second.template.name = "log-too".to_string();
        sensor.spec.triggers[0].weight = 20;
        second.weight = 20;
        sensor.spec.triggers.push(second);

        let (_tx, rx) = mpsc::channel(1);
        let result = listener(sensor, Arc::new(InMemoryStore::new()))
            .run(rx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_panicked_trigger_is_marked_error() {
        let sensor = Arc::new(sensor(TWO_DEPS));
        let mut state = SensorState::new("two-deps", SensorStatus::default());
        state.initialize(&sensor.spec);
        let registry = TriggerRegistry::new(
            TriggerEnv::new("two-deps", "default", None, SecretReader::new("/nonexistent")),
            Arc::new(ClientCache::new()),
        );
        let mut actor = Actor {
            state,
            sensor: sensor.clone(),
            gates: Some(validate_sensor(&sensor).unwrap()),
            registry: Arc::new(registry),
            store: Arc::new(InMemoryStore::new()),
            persist_schedule: BackoffSchedule::new(Duration::from_millis(1), 2.0, 0.0, 3),
            in_flight: HashMap::new(),
            running: JoinSet::new(),
            tasks: HashMap::new(),
            cancel: CancellationToken::new(),
        };

        actor.in_flight.insert("log-it".to_string(), "fp".to_string());
        let handle = actor.running.spawn(async {
            let explode = true;
            if explode {
                panic!("trigger blew up");
            }
            Ok(TriggerOutput::Ack)
        });
        actor.tasks.insert(
            handle.id(),
            TriggerRun {
                trigger: "log-it".to_string(),
                fingerprint: "fp".to_string(),
            },
        );

        let joined = actor.running.join_next_with_id().await.unwrap();
        actor.on_joined(joined);

        assert!(actor.in_flight.is_empty());
        assert!(actor.tasks.is_empty());
        let node = actor.state.node("log-it").unwrap();
        assert_eq!(node.phase, NodePhase::Error);
        assert!(node.message.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancel_during_execution_leaves_trigger_active() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = target.accept().await.unwrap();
            let _ = accepted_tx.send(());
            // never answer
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let yaml = format!(
            r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: hanging
spec:
  dependencies:
    - name: dep1
      eventSourceName: webhook
      eventName: one
  triggers:
    - template:
        name: hook
        http:
          url: http://{}/hook
"#,
            addr
        );
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener(sensor(&yaml), store.clone()).run(rx, cancel.clone()));

        tx.send(event("1", "webhook", "one", "{}")).await.unwrap();
        accepted_rx.await.unwrap();
        cancel.cancel();
        let status = run.await.unwrap().unwrap();

        let node = status.nodes.values().find(|n| n.name == "hook").unwrap();
        assert_eq!(node.phase, NodePhase::Active);
        assert!(node.fingerprints.is_empty());
        assert_eq!(status.trigger_cycle_count, 0);
        assert_eq!(store.status("hanging").await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_resolved_dependencies_fire_after_restart() {
        let sensor = sensor(TWO_DEPS);
        let mut state = SensorState::new("two-deps", SensorStatus::default());
        state.initialize(&sensor.spec);
        state
            .mark_node_phase("dep1", NodePhase::Resolved, Some(event("1", "webhook", "one", "{}")), None)
            .unwrap();
        state
            .mark_node_phase("dep2", NodePhase::Resolved, Some(event("2", "webhook", "two", "{}")), None)
            .unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.update("two-deps", state.status(), None).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let status = listener(sensor, store.clone())
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(trigger_phase(&status, "log-it"), Some(NodePhase::Complete));
        assert_eq!(status.trigger_cycle_count, 1);
        assert_eq!(status.phase, SensorPhase::Complete);
    }
}
