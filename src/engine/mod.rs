//! Playbook execution engine.
//!
//! [`Engine`] owns every live run. `start` validates the playbook, snapshots
//! it and spawns a walk; the caller gets an [`ExecutionHandle`] back at once
//! and observes progress through `status`, `wait` or an event channel.

pub mod dry_run;
pub mod events;
mod scheduler;

pub use dry_run::CostEstimate;
pub use events::{EventReceiver, EventSender, RunEvent};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::consensus::{ConsensusAggregator, ConsensusConfig};
use crate::errors::{EngineError, EngineResult};
use crate::executors::ExecutorRegistry;
use crate::ledger::{Attribution, Cost, CostLedger};
use crate::playbook::{
    ExecutionStatus, Playbook, PlaybookExecution, StepError, StepGraph, StepGraphBuilder,
};
use crate::store::ExecutionStore;
use scheduler::Run;

/// Scheduling limits shared by every run of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Steps of one run that may execute at the same time.
    pub max_parallel: usize,
    /// Applied to `human_input` steps without their own timeout.
    pub human_input_timeout: Option<Duration>,
    /// Default spending cap per run.
    pub run_cap: Option<Cost>,
    /// Finished runs kept in memory when there is no store to read them from.
    pub retain_finished: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            human_input_timeout: None,
            run_cap: None,
            retain_finished: 256,
        }
    }
}

/// Per-run options for [`Engine::start`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub caller: Option<String>,
    pub project_id: Option<Uuid>,
    pub stage: Option<String>,
    pub budget_cap: Option<Cost>,
    pub events: Option<EventSender>,
}

impl RunOptions {
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = Some(caller.to_string());
        self
    }

    pub fn for_project(mut self, project_id: Uuid, stage: &str) -> Self {
        self.project_id = Some(project_id);
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_budget(mut self, cap: Cost) -> Self {
        self.budget_cap = Some(cap);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }
}

/// Opaque reference to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(Uuid);

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ExecutionHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) struct EngineInner {
    registry: ExecutorRegistry,
    gateway: Arc<crate::provider::ProviderGateway>,
    settings: SchedulerSettings,
    runs: Mutex<HashMap<Uuid, Arc<Run>>>,
    /// Finished runs still held in `runs`, oldest first.
    finished: Mutex<VecDeque<Uuid>>,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl EngineInner {
    /// Release a finished run.
    ///
    /// Its ledger state is closed. A stored run leaves memory, since `status`
    /// reads it back from the store; otherwise the newest `retain_finished`
    /// runs stay available.
    pub(crate) fn retire(&self, run_id: Uuid, stored: bool) {
        self.gateway.ledger().close_run(run_id);
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if stored {
            runs.remove(&run_id);
            return;
        }
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        if finished.contains(&run_id) {
            return;
        }
        finished.push_back(run_id);
        while finished.len() > self.settings.retain_finished {
            if let Some(oldest) = finished.pop_front() {
                runs.remove(&oldest);
            }
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    gateway: Arc<crate::provider::ProviderGateway>,
    settings: SchedulerSettings,
    consensus: ConsensusConfig,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Engine {
        let aggregator = ConsensusAggregator::new(self.gateway.clone(), self.consensus);
        Engine {
            inner: Arc::new(EngineInner {
                registry: ExecutorRegistry::new(self.gateway.clone(), aggregator),
                gateway: self.gateway,
                settings: self.settings,
                runs: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                store: self.store,
            }),
        }
    }
}

/// Runs playbooks. Cheap to clone; clones share every run.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(gateway: Arc<crate::provider::ProviderGateway>) -> EngineBuilder {
        EngineBuilder {
            gateway,
            settings: SchedulerSettings::default(),
            consensus: ConsensusConfig::default(),
            store: None,
        }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        self.inner.gateway.ledger()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Estimate a playbook's cost without starting a run.
    pub fn estimate(&self, playbook: &Playbook, inputs: &Map<String, Value>) -> EngineResult<CostEstimate> {
        let graph = StepGraphBuilder::new(playbook).build()?;
        Ok(dry_run::estimate(
            &graph,
            &self.inner.registry,
            &self.inner.gateway,
            inputs,
        ))
    }

    /// Validate and start a run.
    ///
    /// A dry run never calls a provider; it finishes immediately with
    /// estimated costs filled in.
    pub async fn start(
        &self,
        playbook: &Playbook,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> EngineResult<ExecutionHandle> {
        let graph = StepGraphBuilder::new(playbook).build()?;
        let mut record = PlaybookExecution::new(playbook, inputs, options.dry_run);
        record.owner = options.caller.clone();
        record.project_id = options.project_id;
        record.stage = options.stage.clone();

        let attribution = Attribution {
            run_id: Some(record.id),
            project_id: options.project_id,
            stage: options.stage.clone(),
            step_id: None,
            caller: options.caller.clone(),
        };

        if options.dry_run {
            return Ok(self.finish_dry_run(playbook, graph, record, attribution, options).await);
        }

        if let Some(cap) = options.budget_cap.or(self.inner.settings.run_cap) {
            self.ledger().set_run_cap(record.id, cap);
        }

        let id = record.id;
        info!(run_id = %id, playbook = %playbook.name, steps = graph.len(), "run started");
        let run = Arc::new(Run::new(playbook.clone(), graph, record, attribution, options.events));
        self.register(run.clone());
        self.inner.persist(&run).await;
        self.inner.spawn_drive(run);
        Ok(ExecutionHandle(id))
    }

    async fn finish_dry_run(
        &self,
        playbook: &Playbook,
        graph: StepGraph,
        mut record: PlaybookExecution,
        attribution: Attribution,
        options: RunOptions,
    ) -> ExecutionHandle {
        let estimate = dry_run::estimate(&graph, &self.inner.registry, &self.inner.gateway, &record.inputs);
        record.estimated_cost = Some(estimate.total);
        record.estimated_step_costs = estimate.per_step;
        for (step_id, message) in estimate.problems {
            record.errors.push(StepError {
                step_id,
                kind: crate::errors::ErrorKind::Validation,
                message,
                at: chrono::Utc::now(),
            });
        }
        let status = if record.errors.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        record.finish(status);
        info!(run_id = %record.id, estimated = %estimate.total, %status, "dry run finished");

        let id = record.id;
        let run = Arc::new(Run::new(playbook.clone(), graph, record, attribution, options.events));
        run.emit(RunEvent::RunFinished {
            run_id: id,
            status,
            total_cost: Cost::ZERO,
        });
        self.register(run.clone());
        self.inner.persist(&run).await;
        ExecutionHandle(id)
    }

    /// Current state of a run, falling back to the store for runs this
    /// engine does not hold.
    pub async fn status(&self, handle: ExecutionHandle) -> EngineResult<PlaybookExecution> {
        match self.run(handle) {
            Ok(run) => {
                if self.inner.expire_if_due(&run).is_some() {
                    self.inner.persist(&run).await;
                }
                Ok(run.snapshot())
            }
            Err(err) => match &self.inner.store {
                Some(store) => store.load_execution(handle.id()).await?.ok_or(err),
                None => Err(err),
            },
        }
    }

    /// Request cancellation.
    ///
    /// In-flight steps finish and their cost is kept; nothing new starts.
    /// A suspended run is cancelled immediately. Cancelling a finished run
    /// does nothing.
    pub async fn cancel(&self, handle: ExecutionHandle) -> EngineResult<()> {
        let Ok(run) = self.run(handle) else {
            // Only finished runs leave memory
            return self.status(handle).await.map(|_| ());
        };
        let finished_now = run.update(|r| {
            if r.status.is_terminal() || r.suspension.is_none() {
                return None;
            }
            r.finish(ExecutionStatus::Cancelled);
            Some(r.total_cost)
        });
        run.cancel.cancel();
        info!(run_id = %run.id, "cancellation requested");

        if let Some(total_cost) = finished_now {
            run.emit(RunEvent::RunFinished {
                run_id: run.id,
                status: ExecutionStatus::Cancelled,
                total_cost,
            });
            self.inner.persist(&run).await;
        }
        Ok(())
    }

    /// Supply the value a suspended `human_input` step is waiting for.
    pub async fn resume(&self, handle: ExecutionHandle, step_id: &str, value: Value) -> EngineResult<()> {
        let Ok(run) = self.run(handle) else {
            let record = self.status(handle).await?;
            return Err(EngineError::InvalidState(format!("run {} is {}", record.id, record.status)));
        };
        if let Some(step) = self.inner.expire_if_due(&run) {
            self.inner.persist(&run).await;
            return Err(EngineError::InputTimeout { step });
        }

        run.update(|r| {
            if r.status.is_terminal() {
                return Err(EngineError::InvalidState(format!("run {} is {}", r.id, r.status)));
            }
            match &r.suspension {
                Some(s) if s.step_id == step_id => {}
                Some(s) => {
                    return Err(EngineError::InvalidState(format!(
                        "run {} is waiting on step {}, not {}",
                        r.id, s.step_id, step_id
                    )));
                }
                None => {
                    return Err(EngineError::InvalidState(format!(
                        "run {} is not waiting for input",
                        r.id
                    )));
                }
            }
            r.suspension = None;
            r.record_result(step_id, value);
            Ok(())
        })?;

        info!(run_id = %run.id, step = step_id, "run resumed");
        run.emit(RunEvent::Resumed {
            run_id: run.id,
            step_id: step_id.to_string(),
        });
        self.inner.spawn_drive(run);
        Ok(())
    }

    /// Wait until the run finishes or suspends.
    pub async fn wait(&self, handle: ExecutionHandle) -> EngineResult<PlaybookExecution> {
        let Ok(run) = self.run(handle) else {
            return self.status(handle).await;
        };
        let mut active = run.active.subscribe();
        loop {
            let idle = *active.borrow_and_update() == 0;
            if idle {
                let snapshot = run.snapshot();
                if snapshot.status.is_terminal() || snapshot.suspension.is_some() {
                    return Ok(snapshot);
                }
            }
            if active.changed().await.is_err() {
                return Ok(run.snapshot());
            }
        }
    }

    /// Start a run and wait for it to finish or suspend.
    pub async fn execute(
        &self,
        playbook: &Playbook,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> EngineResult<PlaybookExecution> {
        let handle = self.start(playbook, inputs, options).await?;
        self.wait(handle).await
    }

    /// Cancel every suspended run whose input deadline has passed.
    pub async fn sweep_expired(&self) -> Vec<ExecutionHandle> {
        let runs: Vec<Arc<Run>> = self.runs().values().cloned().collect();
        let mut expired = Vec::new();
        for run in runs {
            if self.inner.expire_if_due(&run).is_some() {
                self.inner.persist(&run).await;
                expired.push(ExecutionHandle(run.id));
            }
        }
        expired
    }

    /// Adopt a persisted run, e.g. after a restart.
    ///
    /// The playbook must be the same step set the run started with. A run
    /// that was mid-walk continues from its recorded results; a suspended
    /// run waits for `resume`.
    pub async fn restore(
        &self,
        playbook: &Playbook,
        execution: PlaybookExecution,
        events: Option<EventSender>,
    ) -> EngineResult<ExecutionHandle> {
        if playbook.digest() != execution.playbook_digest {
            return Err(EngineError::InvalidState(format!(
                "playbook {} changed since run {} started",
                playbook.name, execution.id
            )));
        }
        if self.runs().contains_key(&execution.id) {
            return Ok(ExecutionHandle(execution.id));
        }

        let graph = StepGraphBuilder::new(playbook).build()?;
        let attribution = Attribution {
            run_id: Some(execution.id),
            project_id: execution.project_id,
            stage: execution.stage.clone(),
            step_id: None,
            caller: execution.owner.clone(),
        };
        let id = execution.id;
        let resumable = !execution.status.is_terminal() && !execution.dry_run;
        let suspended = execution.suspension.is_some();
        self.ledger().adopt_run_total(id, execution.total_cost);

        let run = Arc::new(Run::new(playbook.clone(), graph, execution, attribution, events));
        self.register(run.clone());
        info!(run_id = %id, resumable, suspended, "run restored");
        if resumable && !suspended {
            self.inner.spawn_drive(run);
        }
        Ok(ExecutionHandle(id))
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Run>>> {
        self.inner.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, run: Arc<Run>) {
        self.runs().insert(run.id, run);
    }

    fn run(&self, handle: ExecutionHandle) -> EngineResult<Arc<Run>> {
        self.runs()
            .get(&handle.id())
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: "execution",
                id: handle.to_string(),
            })
    }
}
