//! The run walker.
//!
//! A run walks its top-level scope from the start step. Each loop iteration
//! walks the loop body as a nested scope. Within a scope:
//!
//! - a step is ready once every in-scope predecessor has settled and at
//!   least one incoming edge is active (the source completed and, for a
//!   condition, chose this step)
//! - a step whose predecessors all settled without an active edge is skipped,
//!   and the skip propagates
//! - ready steps run concurrently up to `max_parallel`
//!
//! A `human_input` step halts launching; in-flight steps drain and the run
//! stays `running` with a suspension until `resume`. A failure halts
//! launching the same way and fails the run after the drain. Cancellation is
//! cooperative: in-flight steps finish and their cost is kept.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::EngineInner;
use super::events::{EventSender, RunEvent};
use crate::errors::{EngineError, EngineResult};
use crate::executors::condition::BRANCH_FIELD;
use crate::executors::{StepContext, StepOutcome, StepOutput, step_error};
use crate::ledger::Attribution;
use crate::playbook::{
    ExecutionStatus, Expr, LoopConfig, Playbook, PlaybookExecution, StepGraph, StepIndex, StepKind,
    Suspension,
};

/// Terminal outcome of a step within a scope.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
    Completed(Value),
    Skipped,
}

/// Readiness tracking for one scope of the graph.
pub(crate) struct Frontier<'g> {
    graph: &'g StepGraph,
    entry: StepIndex,
    members: Vec<StepIndex>,
    settled: HashMap<StepIndex, Settled>,
}

impl<'g> Frontier<'g> {
    pub fn new(graph: &'g StepGraph, entry: StepIndex, owner: Option<StepIndex>) -> Self {
        let members = (0..graph.len()).filter(|&i| graph.scope(i) == owner).collect();
        Self {
            graph,
            entry,
            members,
            settled: HashMap::new(),
        }
    }

    pub fn members(&self) -> &[StepIndex] {
        &self.members
    }

    pub fn settle(&mut self, index: StepIndex, outcome: Settled) {
        self.settled.entry(index).or_insert(outcome);
    }

    /// Whether the edge `from -> to` carries control.
    fn active(&self, from: StepIndex, to: StepIndex) -> bool {
        match self.settled.get(&from) {
            Some(Settled::Completed(output)) => match &self.graph.step(from).kind {
                StepKind::Condition(_) => {
                    output.get(BRANCH_FIELD).and_then(Value::as_str) == Some(self.graph.id(to))
                }
                _ => true,
            },
            _ => false,
        }
    }

    /// Decide every step that can be decided now.
    ///
    /// Returns the steps ready to run, best order first, and the steps newly
    /// skipped. Steps in `busy` are running and left alone.
    pub fn advance(&mut self, busy: &HashSet<StepIndex>) -> (Vec<StepIndex>, Vec<StepIndex>) {
        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        loop {
            let mut changed = false;
            for &node in &self.members {
                if self.settled.contains_key(&node) || busy.contains(&node) || ready.contains(&node) {
                    continue;
                }
                if node == self.entry {
                    ready.push(node);
                    continue;
                }
                let preds = self.graph.predecessors(node);
                if preds.is_empty() || !preds.iter().all(|p| self.settled.contains_key(p)) {
                    continue;
                }
                if preds.iter().any(|&p| self.active(p, node)) {
                    ready.push(node);
                } else {
                    self.settled.insert(node, Settled::Skipped);
                    skipped.push(node);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        ready.sort_by_key(|&i| (self.graph.step(i).order, i));
        (ready, skipped)
    }
}

/// Live state of one run, owned by the engine.
pub(crate) struct Run {
    pub id: Uuid,
    pub playbook: Playbook,
    pub graph: StepGraph,
    pub inputs: Map<String, Value>,
    pub attribution: Attribution,
    pub cancel: CancellationToken,
    pub events: Option<EventSender>,
    record: Mutex<PlaybookExecution>,
    /// Serializes walks of the same run.
    drive_lock: tokio::sync::Mutex<()>,
    /// Number of walks scheduled or in progress.
    pub active: watch::Sender<usize>,
}

impl Run {
    pub fn new(
        playbook: Playbook,
        graph: StepGraph,
        record: PlaybookExecution,
        attribution: Attribution,
        events: Option<EventSender>,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            id: record.id,
            inputs: record.inputs.clone(),
            playbook,
            graph,
            attribution,
            cancel: CancellationToken::new(),
            events,
            record: Mutex::new(record),
            drive_lock: tokio::sync::Mutex::new(()),
            active,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybookExecution> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> PlaybookExecution {
        self.lock().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut PlaybookExecution) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Where a scope walk ended.
enum ScopeExit {
    Done(Map<String, Value>),
    Suspended,
    Failed(EngineError),
    Cancelled,
}

/// One scope to walk: the top level, or one iteration of a loop body.
struct ScopeFrame {
    entry: StepIndex,
    owner: Option<StepIndex>,
    outer_steps: Map<String, Value>,
    loop_vars: Option<Value>,
    iteration: Option<u32>,
}

impl EngineInner {
    /// Schedule a walk of `run` on the runtime.
    pub(crate) fn spawn_drive(self: &Arc<Self>, run: Arc<Run>) {
        run.active.send_modify(|n| *n += 1);
        let inner = Arc::clone(self);
        let span = info_span!("run", run_id = %run.id, playbook = %run.playbook.name);
        tokio::spawn(
            async move {
                {
                    let _walking = run.drive_lock.lock().await;
                    inner.drive(&run).await;
                }
                inner.schedule_expiry(&run);
                run.active.send_modify(|n| *n = n.saturating_sub(1));
            }
            .instrument(span),
        );
    }

    async fn drive(&self, run: &Run) {
        if run.snapshot().status.is_terminal() {
            return;
        }

        let frame = ScopeFrame {
            entry: run.graph.start(),
            owner: None,
            outer_steps: Map::new(),
            loop_vars: None,
            iteration: None,
        };
        let exit = self.walk_scope(run, frame).await;
        let cancelled = run.cancel.is_cancelled();

        let status = match exit {
            ScopeExit::Failed(_) => Some(ExecutionStatus::Failed),
            _ if cancelled => Some(ExecutionStatus::Cancelled),
            ScopeExit::Cancelled => Some(ExecutionStatus::Cancelled),
            ScopeExit::Suspended => None,
            ScopeExit::Done(_) => Some(ExecutionStatus::Completed),
        };

        let spent = self.gateway.ledger().run_total(run.id);
        let finished = run.update(|record| {
            record.raise_cost(spent);
            match status {
                Some(status) if !record.status.is_terminal() => {
                    record.finish(status);
                    Some((record.status, record.total_cost))
                }
                _ => None,
            }
        });

        if let Some((status, total_cost)) = finished {
            info!(%status, cost = %total_cost, "run finished");
            run.emit(RunEvent::RunFinished {
                run_id: run.id,
                status,
                total_cost,
            });
        }
        self.persist(run).await;
    }

    fn walk_scope<'a>(&'a self, run: &'a Run, frame: ScopeFrame) -> BoxFuture<'a, ScopeExit> {
        Box::pin(async move {
            let graph = &run.graph;
            let top = frame.owner.is_none();
            let mut frontier = Frontier::new(graph, frame.entry, frame.owner);

            if top {
                let record = run.snapshot();
                for idx in frontier.members().to_vec() {
                    let id = graph.id(idx);
                    if let Some(output) = record.results.get(id) {
                        frontier.settle(idx, Settled::Completed(output.clone()));
                    } else if record.skipped.contains(id) {
                        frontier.settle(idx, Settled::Skipped);
                    }
                }
            }

            let max_parallel = self.settings.max_parallel.max(1);
            let mut local = Map::new();
            let mut running = HashSet::new();
            let mut in_flight = FuturesUnordered::new();
            let mut halt: Option<ScopeExit> = None;

            loop {
                if halt.is_none() && run.cancel.is_cancelled() {
                    halt = Some(ScopeExit::Cancelled);
                }

                if halt.is_none() {
                    let (ready, skipped) = frontier.advance(&running);
                    for idx in skipped {
                        let id = graph.id(idx);
                        debug!(step = id, "step skipped");
                        if top {
                            run.update(|r| r.record_skip(id));
                        }
                        run.emit(RunEvent::StepSkipped {
                            run_id: run.id,
                            step_id: id.to_string(),
                        });
                    }
                    for idx in ready {
                        if running.len() >= max_parallel {
                            break;
                        }
                        running.insert(idx);
                        let step = graph.step(idx);
                        debug!(step = %step.id, step_type = %step.step_type(), iteration = frame.iteration, "step started");
                        run.emit(RunEvent::StepStarted {
                            run_id: run.id,
                            step_id: step.id.clone(),
                            step_type: step.step_type(),
                            iteration: frame.iteration,
                        });
                        let values = self.context(run, &frame, &local);
                        in_flight.push(async move { (idx, self.run_step(run, idx, values).await) });
                    }
                }

                if in_flight.is_empty() {
                    break;
                }

                tokio::select! {
                    _ = run.cancel.cancelled(), if halt.is_none() => {
                        info!(in_flight = in_flight.len(), "cancellation requested, draining in-flight steps");
                        halt = Some(ScopeExit::Cancelled);
                    }
                    Some((idx, result)) = in_flight.next() => {
                        running.remove(&idx);
                        let id = graph.id(idx).to_string();
                        match result {
                            Ok(StepOutcome::Completed(out)) => {
                                self.complete_step(run, &frame, idx, out, &mut local);
                                frontier.settle(idx, Settled::Completed(local.get(&id).cloned().unwrap_or(Value::Null)));
                            }
                            Ok(StepOutcome::Suspend { prompt, timeout }) => {
                                if halt.is_some() {
                                    continue;
                                }
                                if !top {
                                    halt = Some(ScopeExit::Failed(step_error(&id, "human input is not allowed inside a loop body")));
                                    continue;
                                }
                                let since = Utc::now();
                                let deadline = timeout
                                    .or(self.settings.human_input_timeout)
                                    .and_then(|t| chrono::Duration::from_std(t).ok())
                                    .map(|t| since + t);
                                run.update(|r| {
                                    r.suspension = Some(Suspension {
                                        step_id: id.clone(),
                                        prompt: prompt.clone(),
                                        since,
                                        deadline,
                                    });
                                });
                                info!(step = %id, "run suspended awaiting input");
                                run.emit(RunEvent::Suspended {
                                    run_id: run.id,
                                    step_id: id.clone(),
                                    prompt,
                                });
                                halt = Some(ScopeExit::Suspended);
                            }
                            Err(err) => {
                                if !matches!(err, EngineError::Cancelled(_)) {
                                    warn!(step = %id, "step failed: {}", err);
                                    run.update(|r| r.record_error(&id, &err));
                                    run.emit(RunEvent::StepFailed {
                                        run_id: run.id,
                                        step_id: id.clone(),
                                        error: err.to_string(),
                                    });
                                }
                                match halt {
                                    None | Some(ScopeExit::Suspended) => halt = Some(ScopeExit::Failed(err)),
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }

            halt.unwrap_or(ScopeExit::Done(local))
        })
    }

    /// Record a completed step in its scope, and in the run record at top level.
    fn complete_step(
        &self,
        run: &Run,
        frame: &ScopeFrame,
        idx: StepIndex,
        out: StepOutput,
        local: &mut Map<String, Value>,
    ) {
        let step = run.graph.step(idx);
        let top = frame.owner.is_none();

        // A finished loop publishes its final iteration's body outputs
        let mut body_outputs = Map::new();
        if let StepKind::Loop(_) = step.kind {
            if let Some(Value::Object(last)) = out
                .output
                .get("history")
                .and_then(Value::as_array)
                .and_then(|h| h.last())
            {
                body_outputs = last.clone();
            }
        }

        let spent = self.gateway.ledger().run_total(run.id);
        if top {
            run.update(|r| {
                for (body_id, value) in &body_outputs {
                    r.record_result(body_id, value.clone());
                }
                r.record_result(&step.id, out.output.clone());
                r.raise_cost(spent);
            });
        }
        for (body_id, value) in body_outputs {
            local.entry(body_id).or_insert(value);
        }
        local.entry(step.id.clone()).or_insert(out.output);

        debug!(step = %step.id, cost = %out.cost, "step completed");
        run.emit(RunEvent::StepCompleted {
            run_id: run.id,
            step_id: step.id.clone(),
            cost: out.cost,
            iteration: frame.iteration,
        });
    }

    fn context(&self, run: &Run, frame: &ScopeFrame, local: &Map<String, Value>) -> Value {
        let mut steps = if frame.owner.is_none() {
            run.update(|r| r.results.clone().into_iter().collect::<Map<String, Value>>())
        } else {
            frame.outer_steps.clone()
        };
        for (id, value) in local {
            steps.insert(id.clone(), value.clone());
        }
        let mut values = json!({
            "inputs": run.inputs,
            "steps": steps,
        });
        if let Some(vars) = &frame.loop_vars {
            values["loop"] = vars.clone();
        }
        values
    }

    async fn run_step(&self, run: &Run, idx: StepIndex, values: Value) -> EngineResult<StepOutcome> {
        let step = run.graph.step(idx);
        match &step.kind {
            StepKind::Loop(config) => self.run_loop(run, idx, config, values).await,
            _ => {
                let ctx = StepContext {
                    run_id: run.id,
                    values: &values,
                    attribution: run.attribution.clone(),
                };
                self.registry.execute(step, &ctx).await
            }
        }
    }

    /// Iterate a loop body until its count or `until` condition is met.
    ///
    /// Running out of `max_iterations` first is a step failure.
    async fn run_loop(
        &self,
        run: &Run,
        idx: StepIndex,
        config: &LoopConfig,
        values: Value,
    ) -> EngineResult<StepOutcome> {
        let step_id = run.graph.id(idx);
        let until = config
            .until
            .as_deref()
            .map(Expr::parse)
            .transpose()
            .map_err(|e| step_error(step_id, format!("invalid until expression: {}", e)))?;
        let entry = run
            .graph
            .body_entry(idx)
            .ok_or_else(|| step_error(step_id, "loop has no body"))?;
        let outer_steps = values
            .get("steps")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut history = Vec::new();
        let mut previous = Value::Null;
        for iteration in 1..=config.max_iterations {
            let loop_vars = json!({
                "iteration": iteration,
                "index": iteration - 1,
                "previous": previous,
            });
            let frame = ScopeFrame {
                entry,
                owner: Some(idx),
                outer_steps: outer_steps.clone(),
                loop_vars: Some(loop_vars.clone()),
                iteration: Some(iteration),
            };
            let outputs = match self.walk_scope(run, frame).await {
                ScopeExit::Done(outputs) => outputs,
                ScopeExit::Failed(err) => return Err(err),
                ScopeExit::Cancelled => return Err(EngineError::Cancelled(run.id.to_string())),
                ScopeExit::Suspended => {
                    return Err(step_error(step_id, "human input is not allowed inside a loop body"));
                }
            };
            debug!(step = step_id, iteration, "loop iteration finished");

            let by_count = config.count.is_some_and(|count| iteration >= count);
            let by_until = until.as_ref().is_some_and(|expr| {
                let mut steps = outer_steps.clone();
                steps.extend(outputs.clone());
                expr.eval(&json!({
                    "inputs": run.inputs,
                    "steps": steps,
                    "loop": loop_vars,
                }))
            });

            previous = Value::Object(outputs.clone());
            history.push(Value::Object(outputs));
            if by_count || by_until {
                return Ok(StepOutcome::Completed(StepOutput::free(json!({
                    "iterations": iteration,
                    "history": history,
                }))));
            }
        }

        Err(step_error(
            step_id,
            format!(
                "loop exceeded max_iterations ({}) without meeting its exit condition",
                config.max_iterations
            ),
        ))
    }

    /// Cancel a suspended run whose input deadline has passed.
    ///
    /// Returns the step that timed out.
    pub(crate) fn expire_if_due(&self, run: &Run) -> Option<String> {
        let expired = run.update(|r| {
            let step = match &r.suspension {
                Some(s) if !r.status.is_terminal() && s.is_expired(Utc::now()) => s.step_id.clone(),
                _ => return None,
            };
            r.record_error(&step, &EngineError::InputTimeout { step: step.clone() });
            r.finish(ExecutionStatus::Cancelled);
            Some((step, r.total_cost))
        });

        let (step, total_cost) = expired?;
        warn!(run_id = %run.id, step = %step, "human input timed out, run cancelled");
        run.cancel.cancel();
        run.emit(RunEvent::RunFinished {
            run_id: run.id,
            status: ExecutionStatus::Cancelled,
            total_cost,
        });
        Some(step)
    }

    /// Arm a timer that cancels the run when its suspension expires.
    fn schedule_expiry(self: &Arc<Self>, run: &Arc<Run>) {
        let Some(deadline) = run.update(|r| r.suspension.as_ref().and_then(|s| s.deadline)) else {
            return;
        };
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        let inner = Arc::clone(self);
        let run = Arc::clone(run);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if inner.expire_if_due(&run).is_some() {
                inner.persist(&run).await;
            }
        });
    }

    /// Save the run's record, and retire the run once it has finished.
    pub(crate) async fn persist(&self, run: &Run) {
        let snapshot = run.snapshot();
        let stored = match &self.store {
            Some(store) => match store.save_execution(&snapshot).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = %run.id, "failed to persist execution: {}", e);
                    false
                }
            },
            None => false,
        };
        if snapshot.status.is_terminal() {
            self.retire(run.id, stored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{ConditionConfig, PromptConfig, Step, StepGraphBuilder};

    fn prompt(id: &str, order: i32) -> Step {
        Step::new(id, order, StepKind::Prompt(PromptConfig { template: id.into() }))
    }

    fn graph(steps: Vec<Step>) -> StepGraph {
        StepGraphBuilder::new(&Playbook::new("t", steps)).build().unwrap()
    }

    fn ids(graph: &StepGraph, list: &[StepIndex]) -> Vec<String> {
        list.iter().map(|&i| graph.id(i).to_string()).collect()
    }

    #[test]
    fn test_join_waits_for_all_predecessors() {
        let g = graph(vec![
            prompt("A", 1).then(&["B", "C"]),
            prompt("B", 2).then(&["D"]),
            prompt("C", 3).then(&["D"]),
            prompt("D", 4).then(&[]),
        ]);
        let idx = |id: &str| g.index_of(id).unwrap();
        let mut f = Frontier::new(&g, g.start(), None);
        let none = HashSet::new();

        assert_eq!(ids(&g, &f.advance(&none).0), vec!["A"]);
        f.settle(idx("A"), Settled::Completed(json!("a")));
        assert_eq!(ids(&g, &f.advance(&none).0), vec!["B", "C"]);

        f.settle(idx("B"), Settled::Completed(json!("b")));
        let busy: HashSet<_> = [idx("C")].into_iter().collect();
        assert!(f.advance(&busy).0.is_empty());

        f.settle(idx("C"), Settled::Completed(json!("c")));
        assert_eq!(ids(&g, &f.advance(&none).0), vec!["D"]);
    }

    #[test]
    fn test_untaken_branch_is_skipped_and_join_still_runs() {
        let g = graph(vec![
            Step::new(
                "C",
                1,
                StepKind::Condition(ConditionConfig {
                    expression: "true".into(),
                    if_true: "T".into(),
                    if_false: "F".into(),
                }),
            ),
            prompt("T", 2).then(&["J"]),
            prompt("F", 3).then(&["F2"]),
            prompt("F2", 4).then(&["J"]),
            prompt("J", 5).then(&[]),
        ]);
        let idx = |id: &str| g.index_of(id).unwrap();
        let mut f = Frontier::new(&g, g.start(), None);
        let none = HashSet::new();

        f.settle(idx("C"), Settled::Completed(json!({"result": true, "branch": "T"})));
        let (ready, skipped) = f.advance(&none);
        assert_eq!(ids(&g, &ready), vec!["T"]);
        assert_eq!(ids(&g, &skipped), vec!["F", "F2"]);

        f.settle(idx("T"), Settled::Completed(json!("t")));
        assert_eq!(ids(&g, &f.advance(&none).0), vec!["J"]);
    }

    #[test]
    fn test_all_predecessors_skipped_skips_join() {
        let g = graph(vec![
            Step::new(
                "C",
                1,
                StepKind::Condition(ConditionConfig {
                    expression: "true".into(),
                    if_true: "T".into(),
                    if_false: "F".into(),
                }),
            ),
            prompt("T", 2).then(&[]),
            prompt("F", 3).then(&["after_f"]),
            prompt("after_f", 4).then(&[]),
        ]);
        let mut f = Frontier::new(&g, g.start(), None);
        f.settle(
            g.index_of("C").unwrap(),
            Settled::Completed(json!({"branch": "T"})),
        );
        let (_, skipped) = f.advance(&HashSet::new());
        assert_eq!(ids(&g, &skipped), vec!["F", "after_f"]);
    }
}
