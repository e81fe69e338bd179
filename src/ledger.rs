//! Cost accounting for runs and Forge projects.
//!
//! Every provider invocation lands here as a [`CostRecord`]. Amounts are kept
//! as integer micro-dollars so totals under concurrent fan-out are exact sums,
//! independent of completion order.
//!
//! The ledger refers to runs and projects by id only. It never owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::ProviderError;

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Records attributed to neither a run nor a project that are kept.
const LOOSE_RECORD_LIMIT: usize = 1024;

/// A monetary amount in micro-dollars.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Convert a dollar amount, rounding to the nearest micro-dollar.
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * MICROS_PER_DOLLAR).round() as u64)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Cost) -> Cost {
        Cost(self.0.saturating_add(other.0))
    }
}

impl std::ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = self.saturating_add(rhs);
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.as_dollars())
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-model pricing, in dollars per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: TokenUsage) -> Cost {
        let input = usage.input_tokens as f64 / 1_000_000.0 * self.input_per_million;
        let output = usage.output_tokens as f64 / 1_000_000.0 * self.output_per_million;
        Cost::from_dollars(input + output)
    }
}

/// Who a cost is attributed to. Identifiers only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl Attribution {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Default::default()
        }
    }

    pub fn for_project(project_id: Uuid, stage: &str) -> Self {
        Self {
            project_id: Some(project_id),
            stage: Some(stage.to_string()),
            ..Default::default()
        }
    }

    pub fn with_step(&self, step_id: &str) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            ..self.clone()
        }
    }

    pub fn with_caller(mut self, caller: Option<String>) -> Self {
        self.caller = caller;
        self
    }
}

/// One metered provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub attribution: Attribution,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: Cost,
    /// Whether the invocation ultimately failed (partial billing).
    #[serde(default)]
    pub failed: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated cost for a run or a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total: Cost,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub record_count: usize,
    pub by_model: BTreeMap<String, Cost>,
    pub by_step: BTreeMap<String, Cost>,
}

#[derive(Default)]
struct LedgerInner {
    run_records: HashMap<Uuid, Vec<CostRecord>>,
    project_records: HashMap<Uuid, Vec<CostRecord>>,
    loose_records: VecDeque<CostRecord>,
    run_totals: HashMap<Uuid, Cost>,
    project_totals: HashMap<Uuid, Cost>,
    run_caps: HashMap<Uuid, Cost>,
    project_caps: HashMap<Uuid, Cost>,
}

/// Shared cost ledger.
///
/// All mutation goes through a single mutex, so concurrent step completions
/// within a run never lose increments.
#[derive(Default)]
pub struct CostLedger {
    inner: Mutex<LedgerInner>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        // A panic while holding the lock cannot leave a half-applied record:
        // every mutation below is a single push or insert.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set a spending cap for a run.
    pub fn set_run_cap(&self, run_id: Uuid, cap: Cost) {
        self.lock().run_caps.insert(run_id, cap);
    }

    /// Register a project with what it has already spent and an optional cap.
    ///
    /// Projects outlive a process, so the caller seeds the running total from
    /// the persisted project.
    pub fn open_project(&self, project_id: Uuid, already_spent: Cost, cap: Option<Cost>) {
        let mut inner = self.lock();
        let total = inner.project_totals.entry(project_id).or_default();
        if *total < already_spent {
            *total = already_spent;
        }
        match cap {
            Some(cap) => inner.project_caps.insert(project_id, cap),
            None => inner.project_caps.remove(&project_id),
        };
    }

    /// Check that spending `estimate` more would stay within every applicable cap.
    pub fn check(&self, attribution: &Attribution, estimate: Cost) -> Result<(), ProviderError> {
        let inner = self.lock();
        Self::check_locked(&inner, attribution, estimate)
    }

    fn check_locked(
        inner: &LedgerInner,
        attribution: &Attribution,
        extra: Cost,
    ) -> Result<(), ProviderError> {
        if let Some(run_id) = attribution.run_id {
            if let Some(cap) = inner.run_caps.get(&run_id) {
                let spent = inner.run_totals.get(&run_id).copied().unwrap_or_default();
                if spent + extra > *cap {
                    return Err(ProviderError::BudgetExceeded {
                        scope: format!("run {}", run_id),
                        spent: (spent + extra).as_dollars(),
                        cap: cap.as_dollars(),
                    });
                }
            }
        }
        if let Some(project_id) = attribution.project_id {
            if let Some(cap) = inner.project_caps.get(&project_id) {
                let spent = inner
                    .project_totals
                    .get(&project_id)
                    .copied()
                    .unwrap_or_default();
                if spent + extra > *cap {
                    return Err(ProviderError::BudgetExceeded {
                        scope: format!("project {}", project_id),
                        spent: (spent + extra).as_dollars(),
                        cap: cap.as_dollars(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a metered invocation.
    ///
    /// The record is always kept, since the money is already spent. The
    /// returned error signals that this charge pushed a scope over its cap.
    pub fn record(
        &self,
        attribution: &Attribution,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        cost: Cost,
        failed: bool,
    ) -> Result<CostRecord, ProviderError> {
        let mut inner = self.lock();
        let over_cap = Self::check_locked(&inner, attribution, cost).err();

        if let Some(run_id) = attribution.run_id {
            *inner.run_totals.entry(run_id).or_default() += cost;
        }
        if let Some(project_id) = attribution.project_id {
            *inner.project_totals.entry(project_id).or_default() += cost;
        }

        let record = CostRecord {
            id: Uuid::new_v4(),
            attribution: attribution.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            usage,
            cost,
            failed,
            recorded_at: Utc::now(),
        };
        match (attribution.run_id, attribution.project_id) {
            (None, None) => {
                if inner.loose_records.len() == LOOSE_RECORD_LIMIT {
                    inner.loose_records.pop_front();
                }
                inner.loose_records.push_back(record.clone());
            }
            (run_id, project_id) => {
                if let Some(run_id) = run_id {
                    inner.run_records.entry(run_id).or_default().push(record.clone());
                }
                if let Some(project_id) = project_id {
                    inner.project_records.entry(project_id).or_default().push(record.clone());
                }
            }
        }

        tracing::debug!(
            provider,
            model,
            cost_micros = cost.micros(),
            run_id = ?attribution.run_id,
            project_id = ?attribution.project_id,
            step = attribution.step_id.as_deref(),
            "cost recorded"
        );

        match over_cap {
            Some(err) => Err(err),
            None => Ok(record),
        }
    }

    /// Seed a run's running total, e.g. when a persisted run is restored.
    pub fn adopt_run_total(&self, run_id: Uuid, spent: Cost) {
        let mut inner = self.lock();
        let total = inner.run_totals.entry(run_id).or_default();
        if *total < spent {
            *total = spent;
        }
    }

    pub fn run_total(&self, run_id: Uuid) -> Cost {
        self.lock().run_totals.get(&run_id).copied().unwrap_or_default()
    }

    pub fn project_total(&self, project_id: Uuid) -> Cost {
        self.lock()
            .project_totals
            .get(&project_id)
            .copied()
            .unwrap_or_default()
    }

    /// All records attributed to a live run.
    pub fn run_records(&self, run_id: Uuid) -> Vec<CostRecord> {
        self.lock().run_records.get(&run_id).cloned().unwrap_or_default()
    }

    pub fn run_summary(&self, run_id: Uuid) -> CostSummary {
        summarize(self.lock().run_records.get(&run_id).into_iter().flatten())
    }

    pub fn project_summary(&self, project_id: Uuid) -> CostSummary {
        summarize(self.lock().project_records.get(&project_id).into_iter().flatten())
    }

    /// Release a finished run: its cap, running total and records.
    ///
    /// The run's execution record keeps the final total; the returned summary
    /// is the last view of its breakdown. Project totals are untouched.
    pub fn close_run(&self, run_id: Uuid) -> CostSummary {
        let mut inner = self.lock();
        inner.run_caps.remove(&run_id);
        inner.run_totals.remove(&run_id);
        let records = inner.run_records.remove(&run_id).unwrap_or_default();
        summarize(records.iter())
    }
}

fn summarize<'a>(records: impl Iterator<Item = &'a CostRecord>) -> CostSummary {
    let mut summary = CostSummary::default();
    for record in records {
        summary.total += record.cost;
        summary.total_input_tokens += record.usage.input_tokens;
        summary.total_output_tokens += record.usage.output_tokens;
        summary.record_count += 1;
        *summary
            .by_model
            .entry(format!("{}/{}", record.provider, record.model))
            .or_default() += record.cost;
        if let Some(step) = &record.attribution.step_id {
            *summary.by_step.entry(step.clone()).or_default() += record.cost;
        }
    }
    summary
}
