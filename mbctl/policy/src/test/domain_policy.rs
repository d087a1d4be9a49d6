// Copyright (c) Facebook, Inc. and its affiliates.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::*;

fn params() -> PolicyParams {
    PolicyParams {
        domain_capacity_mb: 30000,
        ccd_min_mb: 1000,
        ccd_max_mb: 20000,
        ease_threshold_mb: 0,
        throttle_threshold_mb: 0,
        ease_mode: EaseMode::Full,
        incubation_floor_per_ccd_mb: 6000,
        ..Default::default()
    }
}

fn plan_of(policy: &mut DomainPolicy, domains: &DomainManager, snapshot: &MbSnapshot) -> Option<MbPlan> {
    policy
        .get_plan(domains, snapshot, Instant::now())
        .expect("Failed to get plan")
        .map(|decision| {
            assert!(decision.allocs.is_empty());
            decision.plan
        })
}

#[test]
fn test_high_group_unlimited_leaf_gets_remainder() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(test_logger(), params());
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Shared(60) => btreemap! {0 => 5000, 1 => 7000, 2 => 6000, 3 => 6000},
        QosGroup::Shared(50) => btreemap! {1 => 3000, 2 => 2000},
    });

    let plan = plan_of(&mut policy, &domains, &snapshot).expect("Expected a plan");
    assert_eq!(
        plan.group(QosGroup::Shared(60)),
        Some(&btreemap! {0 => 20000, 1 => 20000, 2 => 20000, 3 => 20000})
    );
    // 30000 capacity less 12000 of shared-60 in each domain.
    assert_eq!(
        plan.group(QosGroup::Shared(50)),
        Some(&btreemap! {1 => 18000, 2 => 18000})
    );
}

#[test]
fn test_hold_steady() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(
        test_logger(),
        PolicyParams {
            ease_threshold_mb: 8000,
            throttle_threshold_mb: 2000,
            ..params()
        },
    );
    // 5000 free: too little to ease, too much to throttle.
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Shared(50) => btreemap! {0 => 15000, 1 => 10000},
    });
    assert_eq!(plan_of(&mut policy, &domains, &snapshot), None);
    assert_eq!(plan_of(&mut policy, &domains, &MbSnapshot::new()), None);
}

#[test]
fn test_leaf_throttled_under_pressure() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(
        test_logger(),
        PolicyParams {
            ease_threshold_mb: 8000,
            throttle_threshold_mb: 2000,
            ..params()
        },
    );
    let snapshot = local_snapshot(btreemap! {
        QosGroup::System => btreemap! {0 => 10000},
        QosGroup::Reclaimed => btreemap! {0 => 12000, 1 => 8000},
    });
    let plan = plan_of(&mut policy, &domains, &snapshot).expect("Expected a plan");
    assert_eq!(plan.group(QosGroup::System), Some(&btreemap! {0 => 20000}));
    // Domain 0 has 20000 left for 20000 of reclaimed traffic: halve it.
    assert_eq!(
        plan.group(QosGroup::Reclaimed),
        Some(&btreemap! {0 => 6000, 1 => 4000})
    );
}

#[test]
fn test_incubation_shrinks_leaf() {
    let domains = one_domain(2);
    let mut policy = DomainPolicy::new(
        test_logger(),
        PolicyParams {
            ccd_max_mb: 40000,
            ..params()
        },
    );
    let t0 = Instant::now();
    assert!(domains.preempt_nodes_at(&[1], t0).expect("preempt failed"));

    let snapshot = local_snapshot(btreemap! {
        QosGroup::Shared(50) => btreemap! {0 => 10000},
        QosGroup::Dedicated => btreemap! {2 => 1000},
    });
    // Protected: 1000 dedicated traffic plus (6000 - 1000) + 6000 held for
    // the incubating CCDs 2 and 3.
    let decision = policy
        .get_plan(&domains, &snapshot, t0 + Duration::from_secs(1))
        .expect("Failed to get plan")
        .expect("Expected a plan");
    assert_eq!(decision.plan.get(QosGroup::Shared(50), 0), Some(18000));
    assert_eq!(decision.plan.get(QosGroup::Dedicated, 2), Some(40000));

    // Expired incubation holds nothing back.
    let decision = policy
        .get_plan(&domains, &snapshot, t0 + Duration::from_secs(11))
        .expect("Failed to get plan")
        .expect("Expected a plan");
    assert_eq!(decision.plan.get(QosGroup::Shared(50), 0), Some(29000));
}

#[test]
fn test_cross_domain_leaf_quota() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(test_logger(), params());
    let mut snapshot = local_snapshot(btreemap! {
        QosGroup::Dedicated => btreemap! {0 => 23000},
    });
    // Half the leaf traffic of domain 1 lands in domain 0.
    snapshot.insert(
        QosGroup::Shared(50),
        MbQosGroup::new(btreemap! {2 => MbData::from_total_local(10000, 5000)}),
    );
    let plan = plan_of(&mut policy, &domains, &snapshot).expect("Expected a plan");
    // Domain 0 has 7000 left and receives half of domain 1's 10000. The
    // least change on 1 * q0 + 0.5 * q1 = 7000 from (0, 10000) is
    // (1600, 10800).
    assert_eq!(plan.get(QosGroup::Shared(50), 2), Some(10800));
}

#[test]
fn test_leaf_only_cross_domain_traffic_fits_capacity() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(test_logger(), params());
    // Three quarters of domain 1's leaf traffic lands in domain 0, which
    // then serves 35000 against a 30000 capacity.
    let snapshot = btreemap! {
        QosGroup::Shared(50) => MbQosGroup::new(btreemap! {
            0 => MbData::from_total_local(20000, 20000),
            2 => MbData::from_total_local(20000, 5000),
        }),
    };

    let plan = plan_of(&mut policy, &domains, &snapshot).expect("Expected a plan");
    let ccd0 = plan.get(QosGroup::Shared(50), 0).expect("CCD 0 not planned");
    let ccd2 = plan.get(QosGroup::Shared(50), 2).expect("CCD 2 not planned");
    // Quotas are (16800, 17600); both domains halve their leaf.
    assert_eq!((ccd0, ccd2), (10000, 10000));
    assert!(ccd0 as f64 + 0.75 * ccd2 as f64 <= 30000.0);
}

#[test]
fn test_unmapped_ccd_fails_cycle() {
    let domains = two_domains();
    let mut policy = DomainPolicy::new(test_logger(), params());
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Shared(50) => btreemap! {0 => 1000, 9 => 1000},
    });
    assert!(policy.get_plan(&domains, &snapshot, Instant::now()).is_err());
}
