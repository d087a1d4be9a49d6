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

use tempfile::TempDir;

use super::*;
use crate::deliver::Deliverer;
use crate::deliver::allocs_to_plan;
use crate::deliver::distribute_ccd_mbs;

fn recording_deliverer() -> (Deliverer, Writes) {
    let setter = RecordingSetter::default();
    let writes = setter.writes.clone();
    (Deliverer::new(test_logger(), Box::new(setter)), writes)
}

#[test]
fn test_distribute_ccd_mbs() {
    // Light usage: split evenly.
    assert_eq!(
        distribute_ccd_mbs(10000, &btreemap! {0 => 1000, 1 => 2000}),
        btreemap! {0 => 5000, 1 => 5000}
    );
    // Heavy usage: follow it.
    assert_eq!(
        distribute_ccd_mbs(10000, &btreemap! {0 => 6000, 1 => 2000}),
        btreemap! {0 => 7500, 1 => 2500}
    );
    assert_eq!(
        distribute_ccd_mbs(10000, &btreemap! {0 => 0, 1 => 0}),
        btreemap! {0 => 5000, 1 => 5000}
    );
    assert!(distribute_ccd_mbs(10000, &BTreeMap::new()).is_empty());
}

#[test]
fn test_allocs_to_plan() {
    let domains = two_domains();
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Dedicated => btreemap! {0 => 8000, 1 => 2000, 2 => 100, 3 => 100},
    });
    let allocs = vec![MbAlloc {
        unit_id: "pod-a".into(),
        ctrl_group: QosGroup::Dedicated,
        nodes: btreeset! {0, 1},
        mb_upper_bound: 20000,
    }];
    let plan = allocs_to_plan(&allocs, &snapshot, &domains).expect("Failed to build plan");
    assert_eq!(
        plan.group(QosGroup::Dedicated),
        Some(&btreemap! {0 => 8000, 1 => 2000, 2 => 5000, 3 => 5000})
    );

    let stray = vec![MbAlloc {
        unit_id: "pod-b".into(),
        ctrl_group: QosGroup::Dedicated,
        nodes: btreeset! {7},
        mb_upper_bound: 20000,
    }];
    assert!(allocs_to_plan(&stray, &snapshot, &domains).is_err());
}

#[test]
fn test_deliver_skips_unchanged() {
    let (mut deliverer, writes) = recording_deliverer();
    let mut plan = MbPlan::from_group(QosGroup::Shared(50), btreemap! {0 => 1000, 1 => 2000});
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 2);
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 0);

    plan.insert(QosGroup::Shared(50), 1, 3000);
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 1);
    assert_eq!(
        writes.lock().unwrap().last(),
        Some(&("shared-50".to_string(), 1, 3000))
    );

    deliverer.reset();
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 2);
    assert_eq!(writes.lock().unwrap().len(), 5);
}

#[test]
fn test_deliver_stops_at_first_failure() {
    let setter = RecordingSetter {
        fail_group: Some("shared-50".into()),
        ..Default::default()
    };
    let writes = setter.writes.clone();
    let mut deliverer = Deliverer::new(test_logger(), Box::new(setter));

    let mut plan = MbPlan::new();
    plan.insert(QosGroup::Reclaimed, 0, 1000);
    plan.insert(QosGroup::Shared(50), 0, 2000);
    plan.insert(QosGroup::Dedicated, 0, 3000);
    assert!(deliverer.deliver_plan(&plan).is_err());
    assert_eq!(
        *writes.lock().unwrap(),
        vec![("reclaimed".to_string(), 0, 1000)]
    );
}

#[test]
fn test_deliver_decision_prefers_explicit_plan() {
    let domains = two_domains();
    let snapshot = local_snapshot(btreemap! {
        QosGroup::Dedicated => btreemap! {0 => 8000, 1 => 2000, 2 => 100, 3 => 100},
    });
    let decision = MbDecision {
        plan: MbPlan::from_group(QosGroup::Dedicated, btreemap! {0 => 1234}),
        allocs: vec![MbAlloc {
            unit_id: "pod-a".into(),
            ctrl_group: QosGroup::Dedicated,
            nodes: btreeset! {0, 1},
            mb_upper_bound: 20000,
        }],
    };
    let (mut deliverer, writes) = recording_deliverer();
    assert_eq!(
        deliverer
            .deliver(&decision, &snapshot, &domains)
            .expect("Failed to deliver"),
        4
    );
    let written: BTreeMap<CcdId, u64> = writes
        .lock()
        .unwrap()
        .iter()
        .map(|(_, ccd, mb)| (*ccd, *mb))
        .collect();
    assert_eq!(written, btreemap! {0 => 1234, 1 => 2000, 2 => 5000, 3 => 5000});
}

#[test]
fn test_resctrl_setter() {
    let dir = TempDir::new().expect("Failed to create tempdir");
    std::fs::create_dir(dir.path().join("shared-50")).unwrap();
    std::fs::write(dir.path().join("shared-50/schemata"), "").unwrap();
    let writer = resctrlfs::ResctrlWriter::new(dir.path().to_path_buf(), 125, 2048, false)
        .expect("Failed to open resctrl");
    let mut setter: Box<dyn MbSetter> = Box::new(writer);
    setter.set_mb("shared-50", 1, 1000).expect("Failed to set");

    let reader = resctrlfs::ResctrlWriter::new(dir.path().to_path_buf(), 125, 2048, false)
        .expect("Failed to open resctrl");
    let schemata = reader.read_schemata("shared-50").expect("Failed to read");
    assert_eq!(schemata.mb, btreemap! {1 => 8});

    assert!(setter.set_mb("missing", 1, 1000).is_err());
}

#[test]
fn test_deliver_rewrites_externally_reset_limits() {
    let dir = TempDir::new().expect("Failed to create tempdir");
    let schemata = dir.path().join("shared-50/schemata");
    std::fs::create_dir(dir.path().join("shared-50")).unwrap();
    std::fs::write(&schemata, "MB:0=2048\n").unwrap();
    let writer = resctrlfs::ResctrlWriter::new(dir.path().to_path_buf(), 125, 2048, false)
        .expect("Failed to open resctrl");
    let mut deliverer = Deliverer::new(test_logger(), Box::new(writer));

    let plan = MbPlan::from_group(QosGroup::Shared(50), btreemap! {0 => 8000});
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 1);
    assert_eq!(std::fs::read_to_string(&schemata).unwrap(), "MB:0=64\n");
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 0);

    // Someone else resets the group.
    std::fs::write(&schemata, "MB:0=2048\n").unwrap();
    assert_eq!(deliverer.deliver_plan(&plan).unwrap(), 1);
    assert_eq!(std::fs::read_to_string(&schemata).unwrap(), "MB:0=64\n");

    // A removed group cannot be skipped either.
    std::fs::remove_file(&schemata).unwrap();
    std::fs::remove_dir(dir.path().join("shared-50")).unwrap();
    assert!(deliverer.deliver_plan(&plan).is_err());
}
