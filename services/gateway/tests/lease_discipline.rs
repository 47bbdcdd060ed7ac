//! Property tests for balancer lease accounting.

use std::sync::Arc;

use proptest::prelude::*;

use edgeway_gateway::proxy::backend::{AllocateHint, BalancerRole, LoadBalancer, Member, Selection};
use edgeway_gateway::proxy::TargetState;
use edgeway_resources::LbAlgorithm;

#[derive(Debug, Clone)]
enum Op {
    Allocate { hash: Option<u64> },
    Free(usize),
    Drop(usize),
    FreeTwice(usize),
    SetHealth(usize, bool),
    /// Bit i keeps target i in the set.
    Update(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::option::of(any::<u64>()).prop_map(|hash| Op::Allocate { hash }),
        2 => any::<usize>().prop_map(Op::Free),
        2 => any::<usize>().prop_map(Op::Drop),
        1 => any::<usize>().prop_map(Op::FreeTwice),
        1 => (0..4usize, any::<bool>()).prop_map(|(i, h)| Op::SetHealth(i, h)),
        1 => any::<u8>().prop_map(Op::Update),
    ]
}

fn algorithm() -> impl Strategy<Value = LbAlgorithm> {
    prop_oneof![
        Just(LbAlgorithm::RoundRobin),
        Just(LbAlgorithm::LeastConnections),
        Just(LbAlgorithm::ConsistentHashing),
    ]
}

fn members(targets: &[Arc<TargetState>], mask: u8) -> Vec<Member> {
    targets
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(i, t)| Member::new(Arc::clone(t), i as u32 % 3))
        .collect()
}

fn total_active(targets: &[Arc<TargetState>]) -> usize {
    targets.iter().map(|t| t.active()).sum()
}

proptest! {
    #[test]
    fn leases_match_held_selections(
        algorithm in algorithm(),
        failover in any::<bool>(),
        ops in proptest::collection::vec(op(), 1..64),
    ) {
        let targets: Vec<Arc<TargetState>> = (0..4)
            .map(|i| Arc::new(TargetState::new("10.0.0.1", 8000 + i, None)))
            .collect();
        let role = if failover { BalancerRole::Failover } else { BalancerRole::Primary };
        let balancer = LoadBalancer::new("pool", algorithm, role, members(&targets, 0b1111));
        let mut held: Vec<Selection> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { hash } => {
                    let hint = AllocateHint { sticky: None, hash };
                    if let Some(selection) = balancer.allocate(&hint, |t| t.is_healthy()) {
                        prop_assert!(selection.target().is_healthy());
                        held.push(selection);
                    }
                }
                Op::Free(i) if !held.is_empty() => {
                    let selection = held.swap_remove(i % held.len());
                    balancer.free(selection);
                }
                Op::Drop(i) if !held.is_empty() => {
                    drop(held.swap_remove(i % held.len()));
                }
                Op::FreeTwice(i) if !held.is_empty() => {
                    let mut selection = held.swap_remove(i % held.len());
                    selection.free();
                    selection.free();
                    prop_assert!(selection.is_released());
                }
                Op::SetHealth(i, healthy) => {
                    targets[i].set_healthy(healthy);
                }
                Op::Update(mask) => {
                    balancer.update_targets(members(&targets, mask));
                }
                _ => {}
            }
            prop_assert_eq!(balancer.active_leases(), held.len());
            prop_assert_eq!(total_active(&targets), held.len());
        }

        held.clear();
        prop_assert_eq!(balancer.active_leases(), 0);
        prop_assert_eq!(total_active(&targets), 0);
    }
}

#[test]
fn failover_role_admits_weight_zero() {
    let standby = Arc::new(TargetState::new("10.0.0.2", 9000, None));
    let primary = LoadBalancer::new(
        "pool",
        LbAlgorithm::RoundRobin,
        BalancerRole::Primary,
        vec![
            Member::new(Arc::new(TargetState::new("10.0.0.1", 9000, None)), 1),
            Member::new(Arc::clone(&standby), 0),
        ],
    );
    assert_eq!(primary.len(), 1);

    let failover = LoadBalancer::new(
        "pool",
        LbAlgorithm::RoundRobin,
        BalancerRole::Failover,
        vec![Member::new(Arc::clone(&standby), 0)],
    );
    let selection = failover
        .allocate(&AllocateHint::default(), |t| t.is_healthy())
        .unwrap_or_else(|| panic!("Expected a failover target"));
    assert_eq!(selection.target().key(), "10.0.0.2:9000");
}
