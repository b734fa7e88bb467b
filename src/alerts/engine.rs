// vigil: Alert evaluation engine

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::eval::evaluate;
use crate::alerts::rule::Rule;
use crate::alerts::schedule::{ScheduleGate, Silences};
use crate::alerts::state::{AlertInstance, AlertState};
use crate::alerts::store::RuleStore;
use crate::alerts::throttle::Throttler;
use crate::error::{CoreError, CoreResult};
use crate::events::{AlertEvent, EventFanout, TransitionKind};
use crate::metrics::MetricRegistry;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub eval_interval: std::time::Duration,
    /// Gap a resolved alert must stay quiet before it may fire again
    pub resolve_quiescence: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eval_interval: std::time::Duration::from_secs(30),
            resolve_quiescence: Duration::seconds(300),
        }
    }
}

/// Narrow callback surface handed to notification adapters
///
/// Adapters act on alerts only through this trait, never through the engine
/// itself, which keeps the manager/adapter dependency one-directional.
#[async_trait]
pub trait AlertCommands: Send + Sync {
    async fn silence(&self, rule_id: Uuid, duration_secs: u64) -> CoreResult<()>;
    async fn resolve(&self, rule_id: Uuid) -> CoreResult<()>;
    async fn refresh(&self) -> CoreResult<()>;
    fn status(&self) -> Vec<AlertInstance>;
}

enum EngineCommand {
    Silence {
        rule_id: Uuid,
        duration_secs: u64,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Resolve {
        rule_id: Uuid,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Refresh,
}

/// Cheap handle for issuing commands and reading the alert snapshot
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    snapshot: Arc<RwLock<Vec<AlertInstance>>>,
}

impl EngineHandle {
    async fn send(&self, command: EngineCommand) -> CoreResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| CoreError::Canceled("alert engine stopped".to_string()))
    }
}

#[async_trait]
impl AlertCommands for EngineHandle {
    async fn silence(&self, rule_id: Uuid, duration_secs: u64) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Silence {
            rule_id,
            duration_secs,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| CoreError::Canceled("alert engine stopped".to_string()))?
    }

    async fn resolve(&self, rule_id: Uuid) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Resolve { rule_id, reply }).await?;
        rx.await
            .map_err(|_| CoreError::Canceled("alert engine stopped".to_string()))?
    }

    async fn refresh(&self) -> CoreResult<()> {
        self.send(EngineCommand::Refresh).await
    }

    fn status(&self) -> Vec<AlertInstance> {
        self.snapshot.read().clone()
    }
}

/// The evaluation loop; sole owner of the alert table
///
/// Each tick evaluates every enabled rule under the schedule, silence, and
/// throttle gates and applies at most one transition per rule. Emitted
/// events go out through the bounded fanout and never block the loop.
pub struct AlertEngine {
    config: EngineConfig,
    store: Arc<RuleStore>,
    registry: Arc<MetricRegistry>,
    gate: Arc<ScheduleGate>,
    silences: Arc<Silences>,
    throttler: Throttler,
    fanout: EventFanout,
    table: HashMap<Uuid, AlertInstance>,
    snapshot: Arc<RwLock<Vec<AlertInstance>>>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
}

impl AlertEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<RuleStore>,
        registry: Arc<MetricRegistry>,
        gate: Arc<ScheduleGate>,
        silences: Arc<Silences>,
        fanout: EventFanout,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let snapshot = Arc::new(RwLock::new(Vec::new()));
        let handle = EngineHandle {
            cmd_tx,
            snapshot: Arc::clone(&snapshot),
        };
        let engine = Self {
            config,
            store,
            registry,
            gate,
            silences,
            throttler: Throttler::new(),
            fanout,
            table: HashMap::new(),
            snapshot,
            cmd_rx,
        };
        (engine, handle)
    }

    /// Drive ticks and commands until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.eval_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.eval_interval.as_secs(),
            "Alert engine started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
                Some(command) = self.cmd_rx.recv() => {
                    self.handle_command(command);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Alert engine stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate every rule once; public so tests can drive time directly
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let rules = self.store.list();
        let live: std::collections::HashSet<Uuid> = rules.iter().map(|r| r.id).collect();
        // instances of deleted rules are dropped quietly
        self.table.retain(|id, _| live.contains(id));

        for rule in &rules {
            if !rule.spec.enabled {
                continue;
            }
            self.evaluate_rule(rule, now);
        }
        self.publish_snapshot();
    }

    fn evaluate_rule(&mut self, rule: &Rule, now: DateTime<Utc>) {
        let silenced_until = self.silences.current(rule.id, now);
        let gate_ok = self.gate.check(rule.spec.schedule.as_ref(), now).is_ok();
        let matched = evaluate(&rule.spec.condition, self.registry.as_ref());

        match self.table.get(&rule.id).map(|i| i.state) {
            None => {
                if matched && gate_ok && silenced_until.is_none() {
                    if self
                        .throttler
                        .allow(rule.id, rule.spec.throttle.as_ref(), now)
                    {
                        let instance = AlertInstance::firing(rule, now);
                        self.table.insert(rule.id, instance.clone());
                        self.emit(TransitionKind::Fired, instance);
                    } else {
                        debug!(rule = %rule.id, "Firing suppressed by throttle");
                        self.table.insert(rule.id, AlertInstance::pending(rule, now));
                    }
                }
            }
            Some(AlertState::Pending) => {
                if !matched {
                    // condition cleared before the alert ever fired
                    self.table.remove(&rule.id);
                } else if gate_ok
                    && silenced_until.is_none()
                    && self
                        .throttler
                        .allow(rule.id, rule.spec.throttle.as_ref(), now)
                {
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        instance.fire(now);
                        let snapshot = instance.clone();
                        self.emit(TransitionKind::Fired, snapshot);
                    }
                } else if let Some(instance) = self.table.get_mut(&rule.id) {
                    instance.touch(now);
                }
            }
            Some(AlertState::Firing) => {
                if let Some(until) = silenced_until {
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        instance.silence(until, now);
                        let snapshot = instance.clone();
                        self.emit(TransitionKind::Silenced, snapshot);
                    }
                } else if !matched {
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        instance.resolve(now);
                        let snapshot = instance.clone();
                        self.emit(TransitionKind::Resolved, snapshot);
                    }
                } else {
                    // maintenance and schedule windows gate notifications but
                    // never resolve a firing alert
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        instance.touch(now);
                    }
                }
            }
            Some(AlertState::Silenced) => {
                if silenced_until.is_some() {
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        instance.silenced_until = silenced_until;
                        instance.touch(now);
                    }
                } else if matched {
                    // silence lapsed while the condition still holds
                    let refires = gate_ok
                        && self
                            .throttler
                            .allow(rule.id, rule.spec.throttle.as_ref(), now);
                    if let Some(instance) = self.table.get_mut(&rule.id) {
                        if refires {
                            instance.refire(now);
                            let snapshot = instance.clone();
                            self.emit(TransitionKind::Fired, snapshot);
                        } else {
                            instance.state = AlertState::Firing;
                            instance.silenced_until = None;
                            instance.touch(now);
                        }
                    }
                } else if let Some(instance) = self.table.get_mut(&rule.id) {
                    instance.resolve(now);
                    let snapshot = instance.clone();
                    self.emit(TransitionKind::Resolved, snapshot);
                }
            }
            Some(AlertState::Resolved) => {
                let quiesced = self
                    .table
                    .get(&rule.id)
                    .and_then(|i| i.resolved_at)
                    .map(|at| now - at >= self.config.resolve_quiescence)
                    .unwrap_or(true);
                if matched && gate_ok && silenced_until.is_none() && quiesced {
                    if self
                        .throttler
                        .allow(rule.id, rule.spec.throttle.as_ref(), now)
                    {
                        // a new episode begins with a fresh first-fired time
                        let instance = AlertInstance::firing(rule, now);
                        self.table.insert(rule.id, instance.clone());
                        self.emit(TransitionKind::Fired, instance);
                    } else {
                        self.table.insert(rule.id, AlertInstance::pending(rule, now));
                    }
                } else if let Some(instance) = self.table.get_mut(&rule.id) {
                    instance.touch(now);
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Silence {
                rule_id,
                duration_secs,
                reply,
            } => {
                let result = self.apply_silence(rule_id, duration_secs, Utc::now());
                let _ = reply.send(result);
                self.publish_snapshot();
            }
            EngineCommand::Resolve { rule_id, reply } => {
                let result = self.apply_resolve(rule_id, Utc::now());
                let _ = reply.send(result);
                self.publish_snapshot();
            }
            EngineCommand::Refresh => {
                self.tick(Utc::now());
            }
        }
    }

    fn apply_silence(&mut self, rule_id: Uuid, duration_secs: u64, now: DateTime<Utc>) -> CoreResult<()> {
        self.store.get(rule_id)?;
        let until = now + Duration::seconds(duration_secs as i64);
        self.silences.silence(rule_id, until);
        info!(rule = %rule_id, until = %until, "Rule silenced");

        if let Some(instance) = self.table.get_mut(&rule_id) {
            if instance.state == AlertState::Firing {
                instance.silence(until, now);
                let snapshot = instance.clone();
                self.emit(TransitionKind::Silenced, snapshot);
            }
        }
        Ok(())
    }

    fn apply_resolve(&mut self, rule_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        self.silences.clear(rule_id);
        let state = self
            .table
            .get(&rule_id)
            .map(|instance| instance.state)
            .ok_or_else(|| CoreError::NotFound(format!("alert for rule {}", rule_id)))?;
        match state {
            AlertState::Pending => {
                // never fired; drop without an event
                self.table.remove(&rule_id);
            }
            AlertState::Resolved => {}
            AlertState::Firing | AlertState::Silenced => {
                if let Some(instance) = self.table.get_mut(&rule_id) {
                    instance.resolve(now);
                    let snapshot = instance.clone();
                    info!(rule = %rule_id, "Alert resolved by operator");
                    self.emit(TransitionKind::Resolved, snapshot);
                }
            }
        }
        Ok(())
    }

    fn emit(&self, kind: TransitionKind, instance: AlertInstance) {
        if !instance.invariants_hold() {
            warn!(rule = %instance.rule_id, state = ?instance.state, "Alert instance invariant violated");
        }
        debug!(rule = %instance.rule_id, kind = ?kind, "Alert transition");
        self.fanout.publish(&AlertEvent::new(kind, instance));
    }

    fn publish_snapshot(&self) {
        let mut instances: Vec<AlertInstance> = self.table.values().cloned().collect();
        instances.sort_by(|a, b| a.rule_name.cmp(&b.rule_name));
        *self.snapshot.write() = instances;
    }
}
