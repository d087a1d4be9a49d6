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

use std::time::Duration;

use maplit::btreemap;
use maplit::btreeset;
use model::DieTopology;
use model::MbData;
use model::MbQosGroup;

use super::*;

mod adjuster;
mod domain_policy;

const INCUBATION: Duration = Duration::from_secs(10);

fn test_logger() -> slog::Logger {
    common::logutil::get_logger()
}

/// Two packages, one NUMA node each, two CCDs per node.
fn two_domains() -> DomainManager {
    let topology = DieTopology::new(
        btreemap! {0 => vec![0], 1 => vec![1]},
        btreemap! {0 => btreeset! {0, 1}, 1 => btreeset! {2, 3}},
    )
    .expect("Failed to build topology");
    DomainManager::new(&topology, INCUBATION).expect("Failed to build domains")
}

/// One package, NUMA nodes 0..n with two CCDs each.
fn one_domain(nodes: usize) -> DomainManager {
    let dies = (0..nodes)
        .map(|n| (n, btreeset! {2 * n, 2 * n + 1}))
        .collect();
    let topology = DieTopology::new(btreemap! {0 => (0..nodes).collect()}, dies)
        .expect("Failed to build topology");
    DomainManager::new(&topology, INCUBATION).expect("Failed to build domains")
}

/// Snapshot of fully local traffic.
fn local_snapshot(groups: BTreeMap<QosGroup, BTreeMap<CcdId, u64>>) -> MbSnapshot {
    groups
        .into_iter()
        .map(|(group, ccds)| {
            let ccd_mb = ccds
                .into_iter()
                .map(|(ccd, mb)| (ccd, MbData::from_total_local(mb, mb)))
                .collect();
            (group, MbQosGroup::new(ccd_mb))
        })
        .collect()
}

#[test]
fn test_incubation_reservation() {
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Dedicated => btreemap! {0 => 2000, 1 => 9000},
        QosGroup::Shared(50) => btreemap! {2 => 9000},
    });
    // Only dedicated traffic covers the floor.
    assert_eq!(incubation_reservation(&[0, 1, 2], &snapshot, 6000), 4000 + 6000);
    assert_eq!(incubation_reservation(&[], &snapshot, 6000), 0);
}

#[test]
fn test_live_incubates_cleansed() {
    let domains = two_domains();
    let t0 = Instant::now();
    assert!(domains.preempt_nodes_at(&[1], t0).expect("preempt failed"));
    let domain = domains.domain(1).expect("Missing domain");
    assert_eq!(live_incubates(domain, t0 + Duration::from_secs(5)), btreeset! {2, 3});
    assert_eq!(live_incubates(domain, t0 + Duration::from_secs(11)), BTreeSet::new());
    assert!(domain.clone_incubates().is_empty());
}

#[test]
fn test_registry_builds_each_kind() {
    let registry = PolicyRegistry::new();
    for (kind, name) in [(PolicyKind::Domain, "domain"), (PolicyKind::Unit, "unit")] {
        let deps = PolicyDeps {
            logger: test_logger(),
            params: PolicyParams::default(),
            pool: AppPool::shared(),
        };
        let policy = registry.build(kind, deps).expect("Failed to build policy");
        assert_eq!(policy.name(), name);
    }
}

#[test]
fn test_policy_kind_serde() {
    let kind: PolicyKind = serde_json::from_str("\"unit\"").expect("Failed to parse");
    assert_eq!(kind, PolicyKind::Unit);
    assert_eq!(
        serde_json::to_string(&EaseMode::Full).expect("Failed to serialize"),
        "\"full\""
    );
    assert!(serde_json::from_str::<SourcerKind>("\"magic\"").is_err());
}
