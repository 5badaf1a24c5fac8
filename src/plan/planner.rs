//! Desired-vs-actual diffing.
//!
//! Each GPU is planned independently. Deletes never touch used devices;
//! creates that cannot legally fit after deletes are dropped, biggest first.
//! Output order is fully determined by the inputs: operations are emitted per
//! GPU in ascending index order, and within a GPU by descending compute-slice
//! cost, ties by descending memory-slice cost, then by profile name.

use std::cmp::Ordering;

use crate::k8s::annotations::SpecAnnotations;
use crate::mig::gpu::Gpu;
use crate::mig::node::NodeState;
use crate::mig::profile::ProfileName;
use crate::mig::{catalog, geometry_add, geometry_remove, Geometry, GpuModel};
use crate::plan::{CreateOperation, DeleteOperation, Plan, PlanError, PlanWarning};

/// Compute the plan that brings `state` to `spec`.
///
/// Fails with [`PlanError::IllegalGeometry`] when the spec names a GPU index
/// the node does not have.
pub fn new_plan(state: &NodeState, spec: &SpecAnnotations) -> Result<Plan, PlanError> {
    for ((index, _), count) in spec.iter() {
        if *count > 0 && state.gpu(*index).is_none() {
            return Err(PlanError::IllegalGeometry { index: *index });
        }
    }

    let mut plan = Plan::default();
    for gpu in state.gpus() {
        plan_gpu(gpu, &spec.desired_geometry(gpu.index()), &mut plan);
    }
    Ok(plan)
}

/// Biggest profiles first: descending compute-slice cost, then descending
/// memory-slice cost per the model's catalog entry, then name so equal shapes
/// order stably. Profiles the catalog does not know for this model cost zero
/// memory slices; they still order deterministically and get dropped by the
/// feasibility check anyway.
fn by_cost_descending(model: &GpuModel, a: &ProfileName, b: &ProfileName) -> Ordering {
    let memory_slices =
        |p: &ProfileName| catalog::slice_cost(model, p).map(|(_, m)| m).unwrap_or(0);
    b.compute_slices()
        .cmp(&a.compute_slices())
        .then(memory_slices(b).cmp(&memory_slices(a)))
        .then(a.as_str().cmp(b.as_str()))
}

fn plan_gpu(gpu: &Gpu, desired: &Geometry, plan: &mut Plan) {
    let current = gpu.geometry();
    let gpu_index = gpu.index();

    let mut profiles: Vec<&ProfileName> = current.keys().chain(desired.keys()).collect();
    profiles.sort();
    profiles.dedup();

    let mut deletes: Vec<(ProfileName, usize)> = Vec::new();
    let mut creates: Vec<(ProfileName, usize)> = Vec::new();

    for profile in profiles {
        let want = desired.get(profile).copied().unwrap_or(0);
        let have = current.get(profile).copied().unwrap_or(0);

        match want.cmp(&have) {
            Ordering::Greater => creates.push((profile.clone(), want - have)),
            Ordering::Less => {
                // only free devices are deletable; surplus used ones stay
                let surplus = have - want;
                let free = gpu.free().get(profile).copied().unwrap_or(0);
                let deletable = surplus.min(free);
                if deletable > 0 {
                    deletes.push((profile.clone(), deletable));
                }
                if surplus > deletable {
                    plan.warnings.push(PlanWarning::WouldEvictUsed {
                        gpu_index,
                        profile: profile.clone(),
                        surplus: surplus - deletable,
                    });
                }
            }
            Ordering::Equal => {}
        }
    }

    // free the largest slice ranges first so creates are more likely to fit
    let model = gpu.model();
    deletes.sort_by(|(a, _), (b, _)| by_cost_descending(model, a, b));
    creates.sort_by(|(a, _), (b, _)| by_cost_descending(model, a, b));

    let mut target = current.clone();
    for (profile, quantity) in &deletes {
        geometry_remove(&mut target, profile, *quantity);
    }
    for (profile, quantity) in &creates {
        geometry_add(&mut target, profile, *quantity);
    }

    // shed creates, biggest first, until the target geometry is allowed
    let mut dropped: Vec<(ProfileName, usize)> = Vec::new();
    while !catalog::geometry_is_legal(gpu.model(), &target) {
        let Some((profile, quantity)) = creates.iter_mut().find(|(_, quantity)| *quantity > 0)
        else {
            break;
        };
        *quantity -= 1;
        geometry_remove(&mut target, profile, 1);
        match dropped.iter_mut().find(|(p, _)| p == profile) {
            Some((_, count)) => *count += 1,
            None => dropped.push((profile.clone(), 1)),
        }
    }
    creates.retain(|(_, quantity)| *quantity > 0);

    for (profile, count) in dropped {
        plan.warnings.push(PlanWarning::CreatesDropped {
            gpu_index,
            profile,
            dropped: count,
        });
    }

    plan.delete_operations
        .extend(deletes.into_iter().map(|(profile, quantity)| DeleteOperation {
            gpu_index,
            profile,
            quantity,
        }));
    plan.create_operations
        .extend(creates.into_iter().map(|(profile, quantity)| CreateOperation {
            gpu_index,
            profile,
            quantity,
        }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mig::catalog::{GpuModel, MODEL_A100_SXM4_40GB};

    fn geometry(pairs: &[(&str, usize)]) -> Geometry {
        pairs
            .iter()
            .map(|(name, count)| (name.parse().unwrap(), *count))
            .collect()
    }

    fn a100(index: u32, used: &[(&str, usize)], free: &[(&str, usize)]) -> Gpu {
        Gpu::new(
            GpuModel::new(MODEL_A100_SXM4_40GB),
            index,
            geometry(used),
            geometry(free),
        )
        .unwrap()
    }

    fn spec(entries: &[(u32, &str, usize)]) -> SpecAnnotations {
        let mut spec = SpecAnnotations::default();
        for (index, profile, count) in entries {
            spec.insert(*index, profile.parse().unwrap(), *count);
        }
        spec
    }

    fn deletes(plan: &Plan) -> Vec<(u32, &str, usize)> {
        plan.delete_operations
            .iter()
            .map(|op| (op.gpu_index, op.profile.as_str(), op.quantity))
            .collect()
    }

    fn creates(plan: &Plan) -> Vec<(u32, &str, usize)> {
        plan.create_operations
            .iter()
            .map(|op| (op.gpu_index, op.profile.as_str(), op.quantity))
            .collect()
    }

    #[test]
    fn empty_gpu_gets_single_create() {
        let state = NodeState::new(vec![a100(0, &[], &[])]);
        let plan = new_plan(&state, &spec(&[(0, "7g.40gb", 1)])).unwrap();

        assert!(plan.delete_operations.is_empty());
        assert_eq!(creates(&plan), vec![(0, "7g.40gb", 1)]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn repartition_deletes_everything_then_creates_largest_first() {
        let state = NodeState::new(vec![a100(0, &[], &[("1g.5gb", 7)])]);
        let plan = new_plan(&state, &spec(&[(0, "3g.20gb", 1), (0, "2g.10gb", 2)])).unwrap();

        assert_eq!(deletes(&plan), vec![(0, "1g.5gb", 7)]);
        assert_eq!(creates(&plan), vec![(0, "3g.20gb", 1), (0, "2g.10gb", 2)]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn surplus_used_devices_are_kept_with_a_warning() {
        let state = NodeState::new(vec![a100(0, &[("1g.5gb", 3)], &[("1g.5gb", 1)])]);
        let plan = new_plan(&state, &spec(&[(0, "1g.5gb", 2)])).unwrap();

        assert_eq!(deletes(&plan), vec![(0, "1g.5gb", 1)]);
        assert!(plan.create_operations.is_empty());
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::WouldEvictUsed {
                gpu_index: 0,
                profile: "1g.5gb".parse().unwrap(),
                surplus: 1,
            }]
        );
    }

    #[test]
    fn deletes_are_planned_before_creates_that_need_the_space() {
        let state = NodeState::new(vec![a100(0, &[], &[("4g.20gb", 1)])]);
        let plan = new_plan(&state, &spec(&[(0, "7g.40gb", 1)])).unwrap();

        assert_eq!(deletes(&plan), vec![(0, "4g.20gb", 1)]);
        assert_eq!(creates(&plan), vec![(0, "7g.40gb", 1)]);
    }

    #[test]
    fn matching_spec_yields_empty_plan() {
        let state = NodeState::new(vec![a100(0, &[("1g.5gb", 1)], &[("1g.5gb", 1)])]);
        let plan = new_plan(&state, &spec(&[(0, "1g.5gb", 2)])).unwrap();
        assert!(plan.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn infeasible_creates_are_dropped_biggest_first() {
        // used 3g.20gb pins 4 memory slices; 7g.40gb can never fit
        let state = NodeState::new(vec![a100(0, &[("3g.20gb", 1)], &[])]);
        let plan = new_plan(
            &state,
            &spec(&[(0, "3g.20gb", 1), (0, "7g.40gb", 1), (0, "1g.5gb", 4)]),
        )
        .unwrap();

        assert!(plan.delete_operations.is_empty());
        assert_eq!(creates(&plan), vec![(0, "1g.5gb", 4)]);
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::CreatesDropped {
                gpu_index: 0,
                profile: "7g.40gb".parse().unwrap(),
                dropped: 1,
            }]
        );
    }

    #[test]
    fn unknown_profile_creates_are_dropped() {
        let state = NodeState::new(vec![a100(0, &[], &[])]);
        let plan = new_plan(&state, &spec(&[(0, "9g.99gb", 1), (0, "1g.5gb", 2)])).unwrap();

        assert_eq!(creates(&plan), vec![(0, "1g.5gb", 2)]);
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::CreatesDropped {
                gpu_index: 0,
                profile: "9g.99gb".parse().unwrap(),
                dropped: 1,
            }]
        );
    }

    #[test]
    fn spec_for_missing_gpu_is_illegal() {
        let state = NodeState::new(vec![a100(0, &[], &[])]);
        let result = new_plan(&state, &spec(&[(4, "1g.5gb", 1)]));
        assert!(matches!(
            result,
            Err(PlanError::IllegalGeometry { index: 4 })
        ));
    }

    #[test]
    fn zero_gpu_node_with_spec_entries_is_illegal() {
        let state = NodeState::default();
        let result = new_plan(&state, &spec(&[(0, "1g.5gb", 1)]));
        assert!(matches!(result, Err(PlanError::IllegalGeometry { .. })));
    }

    #[test]
    fn plans_each_gpu_independently() {
        let state = NodeState::new(vec![
            a100(0, &[], &[("1g.5gb", 2)]),
            a100(1, &[], &[("7g.40gb", 1)]),
        ]);
        let plan = new_plan(
            &state,
            &spec(&[(0, "2g.10gb", 1), (1, "3g.20gb", 2)]),
        )
        .unwrap();

        assert_eq!(
            deletes(&plan),
            vec![(0, "1g.5gb", 2), (1, "7g.40gb", 1)]
        );
        assert_eq!(
            creates(&plan),
            vec![(0, "2g.10gb", 1), (1, "3g.20gb", 2)]
        );
    }

    #[test]
    fn output_is_deterministic() {
        let state = NodeState::new(vec![a100(
            0,
            &[("1g.5gb", 1)],
            &[("2g.10gb", 2), ("1g.5gb", 1)],
        )]);
        let spec = spec(&[(0, "3g.20gb", 1), (0, "2g.10gb", 1), (0, "1g.5gb", 2)]);

        let first = new_plan(&state, &spec).unwrap();
        for _ in 0..16 {
            assert_eq!(new_plan(&state, &spec).unwrap(), first);
        }
    }

    #[test]
    fn deletes_never_exceed_free_counts() {
        let state = NodeState::new(vec![a100(
            0,
            &[("2g.10gb", 1), ("1g.5gb", 2)],
            &[("2g.10gb", 1), ("1g.5gb", 1)],
        )]);
        let plan = new_plan(&state, &spec(&[(0, "3g.20gb", 1)])).unwrap();

        let gpu = state.gpu(0).unwrap();
        for op in &plan.delete_operations {
            let free = gpu.free().get(&op.profile).copied().unwrap_or(0);
            assert!(op.quantity <= free);
        }
    }
}
