//! Step graph construction and validation.
//!
//! The builder turns a playbook's step list into an arena indexed by
//! position, with effective successor and predecessor lists. Validation
//! enforces:
//! - unique ids and existing references
//! - condition steps branching to exactly two distinct successors
//! - loop bodies forming closed scopes, with edges back to their loop as
//!   the only allowed cycles
//! - acyclicity of every other edge (Kahn's algorithm)

use std::collections::{HashMap, HashSet};

use super::expr::Expr;
use super::model::{Playbook, Step, StepKind};
use crate::errors::ValidationError;

/// Index into the step arena.
pub type StepIndex = usize;

/// A validated playbook graph.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<Step>,
    index_map: HashMap<String, StepIndex>,
    /// Effective successors, excluding back-edges into the owning loop.
    successors: Vec<Vec<StepIndex>>,
    /// Predecessors that are reachable within the same scope.
    predecessors: Vec<Vec<StepIndex>>,
    /// Owning loop of each step; `None` for top-level steps.
    scope: Vec<Option<StepIndex>>,
    /// Entry of each loop body, keyed by loop index.
    body_entry: HashMap<StepIndex, StepIndex>,
    start: StepIndex,
}

impl StepGraph {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: StepIndex) -> &Step {
        &self.steps[index]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn index_of(&self, id: &str) -> Option<StepIndex> {
        self.index_map.get(id).copied()
    }

    pub fn id(&self, index: StepIndex) -> &str {
        &self.steps[index].id
    }

    pub fn start(&self) -> StepIndex {
        self.start
    }

    pub fn successors(&self, index: StepIndex) -> &[StepIndex] {
        self.successors.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn predecessors(&self, index: StepIndex) -> &[StepIndex] {
        self.predecessors.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn scope(&self, index: StepIndex) -> Option<StepIndex> {
        self.scope[index]
    }

    /// Entry step of a loop's body.
    pub fn body_entry(&self, loop_index: StepIndex) -> Option<StepIndex> {
        self.body_entry.get(&loop_index).copied()
    }

    /// Steps reachable from `entry` inside the scope `entry` belongs to.
    pub fn reachable_from(&self, entry: StepIndex) -> HashSet<StepIndex> {
        let mut seen = HashSet::new();
        let mut stack = vec![entry];
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.successors(node).iter().copied());
            }
        }
        seen
    }
}

/// Builder for step graphs.
pub struct StepGraphBuilder<'a> {
    playbook: &'a Playbook,
}

impl<'a> StepGraphBuilder<'a> {
    pub fn new(playbook: &'a Playbook) -> Self {
        Self { playbook }
    }

    /// Validate the playbook and build its graph.
    pub fn build(self) -> Result<StepGraph, ValidationError> {
        let steps = self.playbook.steps.clone();
        if steps.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut index_map = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index_map.insert(step.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateStep(step.id.clone()));
            }
        }
        let resolve = |from: &str, id: &str| {
            index_map
                .get(id)
                .copied()
                .ok_or_else(|| ValidationError::UnknownStep {
                    step: from.to_string(),
                    target: id.to_string(),
                })
        };

        let scope = Self::resolve_scopes(&steps, &index_map)?;

        // Effective successors per step
        let mut successors: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            let explicit = match &step.next_steps {
                Some(next) => Some(
                    next.iter()
                        .map(|id| resolve(&step.id, id))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                None => None,
            };

            let targets = match &step.kind {
                StepKind::Condition(cond) => {
                    Self::condition_targets(step, cond, explicit.as_deref(), &resolve)?
                }
                _ => match explicit {
                    Some(targets) => targets,
                    None => Self::implicit_successor(&steps, &scope, i).into_iter().collect(),
                },
            };

            let mut seen = HashSet::new();
            for target in targets {
                if !seen.insert(target) {
                    continue;
                }
                if target == i {
                    return Err(ValidationError::Cycle(vec![step.id.clone()]));
                }
                // An edge from a body step back to its own loop ends the iteration
                if scope[i] == Some(target) {
                    continue;
                }
                if scope[target] != scope[i] {
                    return Err(ValidationError::LoopBoundary {
                        step: step.id.clone(),
                        target: steps[target].id.clone(),
                    });
                }
                successors[i].push(target);
            }
        }

        let start = match &self.playbook.start_step {
            Some(id) => {
                let idx = index_map
                    .get(id)
                    .copied()
                    .ok_or_else(|| ValidationError::MissingStart(id.clone()))?;
                if scope[idx].is_some() {
                    return Err(ValidationError::LoopBoundary {
                        step: "<start>".to_string(),
                        target: id.clone(),
                    });
                }
                idx
            }
            None => (0..steps.len())
                .filter(|&i| scope[i].is_none())
                .min_by_key(|&i| (steps[i].order, i))
                .ok_or_else(|| ValidationError::MissingStart("<top level>".to_string()))?,
        };

        Self::validate_configs(&steps, &scope)?;
        Self::validate_no_cycles(&steps, &successors)?;
        let body_entry = Self::resolve_body_entries(&steps, &scope, &successors)?;

        // Predecessors count only sources reachable within their scope, so a
        // join never waits on a step that cannot run.
        let mut reachable: HashSet<StepIndex> = HashSet::new();
        let mut stack = vec![start];
        stack.extend(body_entry.values().copied());
        while let Some(node) = stack.pop() {
            if reachable.insert(node) {
                stack.extend(successors[node].iter().copied());
            }
        }
        let mut predecessors: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];
        for (from, targets) in successors.iter().enumerate() {
            if !reachable.contains(&from) {
                continue;
            }
            for &to in targets {
                predecessors[to].push(from);
            }
        }

        Ok(StepGraph {
            steps,
            index_map,
            successors,
            predecessors,
            scope,
            body_entry,
            start,
        })
    }

    /// Assign every step to at most one loop body and check loop configs.
    fn resolve_scopes(
        steps: &[Step],
        index_map: &HashMap<String, StepIndex>,
    ) -> Result<Vec<Option<StepIndex>>, ValidationError> {
        let mut scope: Vec<Option<StepIndex>> = vec![None; steps.len()];

        for (i, step) in steps.iter().enumerate() {
            let StepKind::Loop(config) = &step.kind else {
                continue;
            };
            let invalid = |message: &str| ValidationError::InvalidLoop {
                step: step.id.clone(),
                message: message.to_string(),
            };
            if config.body.is_empty() {
                return Err(invalid("body is empty"));
            }
            if config.max_iterations == 0 {
                return Err(invalid("max_iterations must be at least 1"));
            }
            if let Some(count) = config.count {
                if count > config.max_iterations {
                    return Err(invalid(&format!(
                        "count {} exceeds max_iterations {}",
                        count, config.max_iterations
                    )));
                }
            }
            if config.count.is_none() && config.until.is_none() {
                return Err(invalid("needs a count or an until condition"));
            }
            for member in &config.body {
                let idx = *index_map.get(member).ok_or_else(|| ValidationError::UnknownStep {
                    step: step.id.clone(),
                    target: member.clone(),
                })?;
                if idx == i {
                    return Err(invalid("body cannot contain the loop itself"));
                }
                if let Some(owner) = scope[idx] {
                    return Err(invalid(&format!(
                        "step '{}' already belongs to loop '{}'",
                        member, steps[owner].id
                    )));
                }
                scope[idx] = Some(i);
            }
        }

        // Loop nesting must be a tree
        for start in 0..steps.len() {
            let mut seen = HashSet::new();
            let mut current = scope[start];
            while let Some(owner) = current {
                if owner == start || !seen.insert(owner) {
                    return Err(ValidationError::InvalidLoop {
                        step: steps[start].id.clone(),
                        message: "loop bodies are nested in a cycle".to_string(),
                    });
                }
                current = scope[owner];
            }
        }

        Ok(scope)
    }

    /// The entry of each loop body: its one member with no in-body
    /// predecessor. Every other member is then reachable from it.
    fn resolve_body_entries(
        steps: &[Step],
        scope: &[Option<StepIndex>],
        successors: &[Vec<StepIndex>],
    ) -> Result<HashMap<StepIndex, StepIndex>, ValidationError> {
        let mut has_predecessor = vec![false; steps.len()];
        for targets in successors {
            for &t in targets {
                has_predecessor[t] = true;
            }
        }

        let mut body_entry = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if !matches!(step.kind, StepKind::Loop(_)) {
                continue;
            }
            let sources: Vec<StepIndex> = (0..steps.len())
                .filter(|&j| scope[j] == Some(i) && !has_predecessor[j])
                .collect();
            match sources.as_slice() {
                [entry] => {
                    body_entry.insert(i, *entry);
                }
                [] => {
                    return Err(ValidationError::InvalidLoop {
                        step: step.id.clone(),
                        message: "body has no entry step".to_string(),
                    });
                }
                many => {
                    let ids: Vec<&str> = many.iter().map(|&j| steps[j].id.as_str()).collect();
                    return Err(ValidationError::InvalidLoop {
                        step: step.id.clone(),
                        message: format!("body has several entry steps: {}", ids.join(", ")),
                    });
                }
            }
        }
        Ok(body_entry)
    }

    fn condition_targets(
        step: &Step,
        cond: &crate::playbook::ConditionConfig,
        explicit: Option<&[StepIndex]>,
        resolve: &impl Fn(&str, &str) -> Result<StepIndex, ValidationError>,
    ) -> Result<Vec<StepIndex>, ValidationError> {
        let ambiguous = |message: &str| ValidationError::AmbiguousBranch {
            step: step.id.clone(),
            message: message.to_string(),
        };
        let on_true = resolve(&step.id, &cond.if_true)?;
        let on_false = resolve(&step.id, &cond.if_false)?;
        if on_true == on_false {
            return Err(ambiguous("if_true and if_false are the same step"));
        }
        if let Some(explicit) = explicit {
            let declared: HashSet<_> = explicit.iter().copied().collect();
            let branches: HashSet<_> = [on_true, on_false].into_iter().collect();
            if declared != branches {
                return Err(ambiguous("next_steps must list exactly the two branches"));
            }
        }
        Ok(vec![on_true, on_false])
    }

    /// The next step by `(order, position)` within the same scope.
    fn implicit_successor(
        steps: &[Step],
        scope: &[Option<StepIndex>],
        index: StepIndex,
    ) -> Option<StepIndex> {
        let key = (steps[index].order, index);
        (0..steps.len())
            .filter(|&j| j != index && scope[j] == scope[index])
            .filter(|&j| (steps[j].order, j) > key)
            .min_by_key(|&j| (steps[j].order, j))
    }

    fn validate_configs(
        steps: &[Step],
        scope: &[Option<StepIndex>],
    ) -> Result<(), ValidationError> {
        for (i, step) in steps.iter().enumerate() {
            let bad_expr = |e: crate::playbook::expr::ParseError| ValidationError::InvalidExpression {
                step: step.id.clone(),
                message: e.to_string(),
            };
            match &step.kind {
                StepKind::Condition(cond) => {
                    Expr::parse(&cond.expression).map_err(bad_expr)?;
                }
                StepKind::Loop(config) => {
                    if let Some(until) = &config.until {
                        Expr::parse(until).map_err(bad_expr)?;
                    }
                }
                StepKind::HumanInput(_) if scope[i].is_some() => {
                    return Err(ValidationError::HumanInputInLoop(step.id.clone()));
                }
                StepKind::LlmCall(config) if config.targets().is_empty() => {
                    return Err(ValidationError::InvalidConfig {
                        step: step.id.clone(),
                        message: "llm_call needs a provider and model".to_string(),
                    });
                }
                StepKind::Transform(config) if config.operations.is_empty() => {
                    return Err(ValidationError::InvalidConfig {
                        step: step.id.clone(),
                        message: "transform needs at least one operation".to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate that the effective edges have no cycles using Kahn's algorithm.
    fn validate_no_cycles(
        steps: &[Step],
        successors: &[Vec<StepIndex>],
    ) -> Result<(), ValidationError> {
        let mut in_degree = vec![0usize; steps.len()];
        for targets in successors {
            for &t in targets {
                in_degree[t] += 1;
            }
        }

        let mut queue: Vec<StepIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &next in &successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if processed != steps.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| steps[i].id.clone())
                .collect();
            return Err(ValidationError::Cycle(involved));
        }

        Ok(())
    }
}
