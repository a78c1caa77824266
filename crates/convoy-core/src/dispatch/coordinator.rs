//! Conflict detection between a proposed call request and the work already
//! in flight, plus dependency-order validation for call request groups.
//!
//! The coordinator is purely advisory: it owns no state and is recomputed
//! from the live waiting/running sets each time it is consulted.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::dispatch::conflict::decide;
use crate::models::call_request::CallRequestId;
use crate::models::error::{DispatchError, DispatchErrorKind};
use crate::models::resource::{Decision, ResourceClaim, ResourceFootprint};

/// Result of weighing a proposed footprint against the in-flight set:
/// the reduced decision, the call requests responsible for it, and the
/// in-flight claims to report back to the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConflictReport {
    pub decision: Decision,
    pub blocking: BTreeSet<CallRequestId>,
    pub reasons: Vec<ResourceClaim>,
}

impl ConflictReport {
    pub fn accepted() -> Self {
        Self {
            decision: Decision::Accept,
            blocking: BTreeSet::new(),
            reasons: Vec::new(),
        }
    }
}

/// Reduce the per-resource decisions across the whole in-flight set.
/// `Reject` dominates `Postpone` dominates `Accept`; an empty footprint is
/// always accepted.
pub fn evaluate<'a>(
    proposed: &ResourceFootprint,
    in_flight: impl IntoIterator<Item = &'a ResourceFootprint>,
) -> Decision {
    let mut decision = Decision::Accept;
    for footprint in in_flight {
        for claim in footprint.iter() {
            if let Some(proposed_operation) =
                proposed.operation_for(claim.resource_type, &claim.resource_id)
            {
                decision = decision.max(decide(claim.operation, proposed_operation));
            }
        }
    }
    decision
}

/// Like [`evaluate`], but also reports which in-flight requests and claims
/// are responsible for the decision.
pub fn find_conflicts<'a>(
    proposed: &ResourceFootprint,
    in_flight: impl IntoIterator<Item = (CallRequestId, &'a ResourceFootprint)>,
) -> ConflictReport {
    if proposed.is_empty() {
        return ConflictReport::accepted();
    }

    let mut postponing: BTreeSet<CallRequestId> = BTreeSet::new();
    let mut postponing_reasons: Vec<ResourceClaim> = Vec::new();
    let mut rejecting: BTreeSet<CallRequestId> = BTreeSet::new();
    let mut rejecting_reasons: Vec<ResourceClaim> = Vec::new();

    for (holder, footprint) in in_flight {
        for claim in footprint.iter() {
            let Some(proposed_operation) =
                proposed.operation_for(claim.resource_type, &claim.resource_id)
            else {
                continue;
            };
            match decide(claim.operation, proposed_operation) {
                Decision::Accept => {}
                Decision::Postpone => {
                    postponing.insert(holder);
                    push_reason(&mut postponing_reasons, claim);
                }
                Decision::Reject => {
                    rejecting.insert(holder);
                    push_reason(&mut rejecting_reasons, claim);
                }
            }
        }
    }

    if !rejecting.is_empty() {
        return ConflictReport {
            decision: Decision::Reject,
            blocking: rejecting,
            reasons: rejecting_reasons,
        };
    }
    if !postponing.is_empty() {
        return ConflictReport {
            decision: Decision::Postpone,
            blocking: postponing,
            reasons: postponing_reasons,
        };
    }
    ConflictReport::accepted()
}

/// The in-flight claims responsible for a postponement or rejection, for
/// user-facing diagnostics.
pub fn blocking_reasons<'a>(
    proposed: &ResourceFootprint,
    in_flight: impl IntoIterator<Item = (CallRequestId, &'a ResourceFootprint)>,
) -> Vec<ResourceClaim> {
    find_conflicts(proposed, in_flight).reasons
}

fn push_reason(reasons: &mut Vec<ResourceClaim>, claim: &ResourceClaim) {
    if !reasons.contains(claim) {
        reasons.push(claim.clone());
    }
}

/// Order call requests so every request comes after the requests it depends
/// on. Dependencies pointing outside the graph are treated as satisfied.
pub fn topological_sort(
    graph: &BTreeMap<CallRequestId, BTreeSet<CallRequestId>>,
) -> Result<Vec<CallRequestId>, DispatchError> {
    let mut in_degree: BTreeMap<CallRequestId, usize> =
        graph.keys().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<CallRequestId, Vec<CallRequestId>> = BTreeMap::new();

    for (node, dependencies) in graph {
        for dependency in dependencies {
            if !graph.contains_key(dependency) {
                continue;
            }
            *in_degree.entry(*node).or_insert(0) += 1;
            dependents.entry(*dependency).or_default().push(*node);
        }
    }

    let mut ready: VecDeque<CallRequestId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(graph.len());

    while let Some(node) = ready.pop_front() {
        sorted.push(node);
        for dependent in dependents.get(&node).cloned().unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(&dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if sorted.len() != graph.len() {
        return Err(DispatchError::new(
            DispatchErrorKind::DependencyCycle,
            "call request dependencies contain a cycle",
        ));
    }
    Ok(sorted)
}
