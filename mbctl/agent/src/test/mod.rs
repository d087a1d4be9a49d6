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

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;

use maplit::btreemap;
use maplit::btreeset;
use model::DieTopology;
use model::MbData;
use model::MbQosGroup;

use super::*;
use crate::deliver::MbSetter;

mod deliver;

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

type Writes = Arc<Mutex<Vec<(String, CcdId, u64)>>>;

/// Records every limit; fails on writes to `fail_group`.
#[derive(Default)]
struct RecordingSetter {
    writes: Writes,
    fail_group: Option<String>,
}

impl MbSetter for RecordingSetter {
    fn set_mb(&mut self, ctrl_group: &str, ccd: CcdId, mb: u64) -> Result<()> {
        if self.fail_group.as_deref() == Some(ctrl_group) {
            bail!("Injected failure on {}", ctrl_group);
        }
        self.writes
            .lock()
            .unwrap()
            .push((ctrl_group.to_string(), ccd, mb));
        Ok(())
    }
}

/// Poll `f` for up to five seconds.
fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}
