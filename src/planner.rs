//! Execution planner: the static dependency graph over the seven phases.
//!
//! The planner is built once per run from the phase catalog. Construction
//! validates the graph (unique numbers, dependencies reference strictly
//! earlier phases, no cycles) and fails fast otherwise. At runtime it answers
//! two questions for the orchestrator: which phases are ready given what has
//! executed, and how the ready set partitions into parallel batches.

use crate::errors::PlannerError;
use crate::phase::PhaseSpec;
use std::collections::{HashMap, HashSet};

/// Index into the planner's phase list.
type PhaseIndex = usize;

/// Validated dependency graph over the pipeline's phases.
#[derive(Debug)]
pub struct ExecutionPlanner {
    /// Phases in ascending phase-number order
    phases: Vec<PhaseSpec>,
    /// Map from phase number to index
    index_map: HashMap<u8, PhaseIndex>,
    /// Forward edges: index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// Reverse edges: index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl ExecutionPlanner {
    /// Build and validate the planner from a phase catalog.
    pub fn new(mut phases: Vec<PhaseSpec>) -> Result<Self, PlannerError> {
        phases.sort_by_key(|p| p.number);

        let mut index_map = HashMap::new();
        for (i, spec) in phases.iter().enumerate() {
            if index_map.insert(spec.number, i).is_some() {
                return Err(PlannerError::DuplicatePhase(spec.number));
            }
            if !(0.0..=1.0).contains(&spec.quality_threshold) {
                return Err(PlannerError::InvalidThreshold {
                    phase: spec.number,
                    threshold: spec.quality_threshold,
                });
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); phases.len()];

        for (to_idx, spec) in phases.iter().enumerate() {
            for &dep in &spec.dependencies {
                let from_idx =
                    *index_map
                        .get(&dep)
                        .ok_or(PlannerError::UnknownDependency {
                            phase: spec.number,
                            dependency: dep,
                        })?;
                if dep >= spec.number {
                    return Err(PlannerError::ForwardDependency {
                        phase: spec.number,
                        dependency: dep,
                    });
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let planner = Self {
            phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        // Earlier-only dependencies already rule out cycles; keep the check
        // against future relaxation of that rule.
        planner.validate_no_cycles()?;

        Ok(planner)
    }

    /// Kahn's algorithm over the reverse edges.
    fn validate_no_cycles(&self) -> Result<(), PlannerError> {
        let mut in_degree: Vec<usize> =
            self.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.phases.len() {
            let phases: Vec<u8> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.phases[i].number)
                .collect();
            return Err(PlannerError::Cycle { phases });
        }

        Ok(())
    }

    /// All phases, ascending by number.
    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// All phase numbers, ascending.
    pub fn phase_numbers(&self) -> Vec<u8> {
        self.phases.iter().map(|p| p.number).collect()
    }

    /// Look up a phase spec by number.
    pub fn get(&self, number: u8) -> Option<&PhaseSpec> {
        self.index_map.get(&number).map(|&i| &self.phases[i])
    }

    /// Phases whose dependencies are all in `executed` and which have not
    /// themselves executed, in ascending phase-number order.
    pub fn ready_phases(&self, executed: &HashSet<u8>) -> Vec<&PhaseSpec> {
        self.phases
            .iter()
            .filter(|spec| {
                !executed.contains(&spec.number)
                    && spec.dependencies.iter().all(|d| executed.contains(d))
            })
            .collect()
    }

    /// Partition a ready set into execution batches.
    ///
    /// Phases sharing a non-null parallel group land in one batch; every
    /// other phase is its own batch. Batch order follows the ready set's
    /// ascending order.
    pub fn group_for_parallel_execution<'a>(
        &self,
        nodes: &[&'a PhaseSpec],
    ) -> Vec<Vec<&'a PhaseSpec>> {
        let mut batches: Vec<Vec<&'a PhaseSpec>> = Vec::new();
        let mut group_batch: HashMap<&str, usize> = HashMap::new();

        for node in nodes {
            match node.parallel_group.as_deref() {
                Some(group) => {
                    if let Some(&idx) = group_batch.get(group) {
                        batches[idx].push(node);
                    } else {
                        group_batch.insert(group, batches.len());
                        batches.push(vec![node]);
                    }
                }
                None => batches.push(vec![node]),
            }
        }

        batches
    }

    /// Phase numbers transitively dependent on `phase` (excluding it).
    ///
    /// This is the invalidation set for regeneration: everything here must be
    /// reset to pending when `phase` is regenerated.
    pub fn dependents_closure(&self, phase: u8) -> HashSet<u8> {
        let mut closure = HashSet::new();
        let Some(&start) = self.index_map.get(&phase) else {
            return closure;
        };

        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for &dep_idx in &self.forward_edges[idx] {
                if closure.insert(self.phases[dep_idx].number) {
                    stack.push(dep_idx);
                }
            }
        }

        closure
    }
}
