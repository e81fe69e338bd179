//! Cost estimation without provider calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::executors::{ExecutorRegistry, StepContext};
use crate::ledger::{Attribution, Cost};
use crate::playbook::{StepGraph, StepIndex, StepKind};
use crate::provider::ProviderGateway;

/// Projected cost of a full run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub total: Cost,
    /// Per step, already multiplied by the number of times the step runs.
    pub per_step: BTreeMap<String, Cost>,
    pub provider_calls: u64,
    /// Steps that could not be estimated, with the reason.
    pub problems: Vec<(String, String)>,
}

/// Walk every step reachable from the start.
///
/// Loop bodies are counted once per iteration: `count` when the loop has
/// one, otherwise `max_iterations`. Every branch of a condition is included,
/// so the figure is an upper bound.
pub fn estimate(
    graph: &StepGraph,
    registry: &ExecutorRegistry,
    gateway: &ProviderGateway,
    inputs: &Map<String, Value>,
) -> CostEstimate {
    let values = json!({"inputs": inputs, "steps": {}});
    let ctx = StepContext {
        run_id: Uuid::nil(),
        values: &values,
        attribution: Attribution::default(),
    };

    let mut estimate = CostEstimate::default();
    visit_scope(graph, graph.start(), 1, registry, gateway, &ctx, &mut estimate);
    estimate
}

fn visit_scope(
    graph: &StepGraph,
    entry: StepIndex,
    multiplier: u64,
    registry: &ExecutorRegistry,
    gateway: &ProviderGateway,
    ctx: &StepContext<'_>,
    estimate: &mut CostEstimate,
) {
    let owner = graph.scope(entry);
    let mut reachable: Vec<StepIndex> = graph
        .reachable_from(entry)
        .into_iter()
        .filter(|&i| graph.scope(i) == owner)
        .collect();
    reachable.sort_by_key(|&i| (graph.step(i).order, i));

    for idx in reachable {
        let step = graph.step(idx);
        match &step.kind {
            StepKind::Loop(config) => {
                let iterations = u64::from(config.count.unwrap_or(config.max_iterations));
                if let Some(body) = graph.body_entry(idx) {
                    visit_scope(
                        graph,
                        body,
                        multiplier.saturating_mul(iterations),
                        registry,
                        gateway,
                        ctx,
                        estimate,
                    );
                }
            }
            StepKind::LlmCall(config) => {
                let targets = config.targets();
                for target in &targets {
                    if !gateway.has_provider(&target.provider) {
                        estimate.problems.push((
                            step.id.clone(),
                            format!("unknown provider '{}'", target.provider),
                        ));
                    }
                }
                estimate.provider_calls += multiplier * targets.len() as u64;
                add(estimate, &step.id, registry.estimate(step, ctx), multiplier);
            }
            _ => add(estimate, &step.id, registry.estimate(step, ctx), multiplier),
        }
    }
}

fn add(estimate: &mut CostEstimate, step_id: &str, unit: Cost, times: u64) {
    let cost = Cost::from_micros(unit.micros().saturating_mul(times));
    estimate.total = estimate.total.saturating_add(cost);
    let entry = estimate.per_step.entry(step_id.to_string()).or_default();
    *entry = entry.saturating_add(cost);
}
