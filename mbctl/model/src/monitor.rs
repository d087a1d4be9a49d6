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

use resctrlfs::ResctrlReader;
use slog::debug;

use super::*;

/// Rate of one CCD as reported by a single counter source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcdRate {
    pub total_mb: u64,
    /// `None` when the source cannot tell local from remote traffic.
    pub local_mb: Option<u64>,
}

impl CcdRate {
    fn local_or_total(&self) -> u64 {
        self.local_mb.unwrap_or(self.total_mb).min(self.total_mb)
    }
}

pub type GroupRates = BTreeMap<QosGroup, BTreeMap<CcdId, CcdRate>>;

/// A source of per-CCD rates keyed by QoS group. CCDs without a valid rate
/// this round are left out rather than reported as errors.
pub trait RateReader: Send {
    fn read_rates(&mut self) -> Result<GroupRates>;
}

/// Produces the bandwidth snapshot the control loop works on.
pub trait Monitor: Send {
    fn get_mb_qos_groups(&mut self) -> Result<MbSnapshot>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Counter {
    Total,
    Local,
}

/// Reads `mbm_total_bytes` and `mbm_local_bytes` of every monitored
/// control group.
pub struct ResctrlRateReader {
    logger: slog::Logger,
    reader: ResctrlReader,
    groups: BTreeSet<QosGroup>,
    inodes: BTreeMap<QosGroup, u64>,
    tracker: RateTracker<(QosGroup, CcdId, Counter)>,
}

impl ResctrlRateReader {
    pub fn new(
        logger: slog::Logger,
        reader: ResctrlReader,
        groups: BTreeSet<QosGroup>,
        staleness: Duration,
    ) -> Self {
        ResctrlRateReader {
            logger,
            reader,
            groups,
            inodes: BTreeMap::new(),
            tracker: RateTracker::new(staleness),
        }
    }

    pub fn read_rates_at(&mut self, now: Instant) -> Result<GroupRates> {
        let sample = self
            .reader
            .read_counters()
            .context("Failed to read resctrl monitoring data")?;

        let mut rates = GroupRates::new();
        let mut seen = BTreeSet::new();
        for (name, stat) in &sample.ctrl_mon_groups {
            let group = match name.parse::<QosGroup>() {
                Ok(g) if self.groups.contains(&g) => g,
                Ok(_) => continue,
                Err(e) => {
                    if !name.is_empty() {
                        common::every_n!(
                            60,
                            debug!(self.logger, "Skipping resctrl group {}: {:#}", name, e)
                        );
                    }
                    continue;
                }
            };

            // A re-created group starts counting from zero.
            if let Some(inode) = stat.inode_number {
                if self.inodes.insert(group, inode).is_some_and(|old| old != inode) {
                    self.tracker.retain(|(g, _, _)| *g != group);
                }
            }

            let mut group_rates = BTreeMap::new();
            for (l3, mon) in stat.l3_mon_stat.iter().flatten() {
                let ccd = *l3 as CcdId;
                let total = mon
                    .mbm_total_bytes
                    .as_ref()
                    .and_then(|b| b.bytes())
                    .and_then(|bytes| {
                        seen.insert((group, ccd, Counter::Total));
                        self.tracker
                            .update((group, ccd, Counter::Total), CounterSample { bytes, at: now })
                    });
                let local = mon
                    .mbm_local_bytes
                    .as_ref()
                    .and_then(|b| b.bytes())
                    .and_then(|bytes| {
                        seen.insert((group, ccd, Counter::Local));
                        self.tracker
                            .update((group, ccd, Counter::Local), CounterSample { bytes, at: now })
                    });
                if let Some(total_mb) = total {
                    group_rates.insert(
                        ccd,
                        CcdRate {
                            total_mb,
                            local_mb: local,
                        },
                    );
                }
            }
            if !group_rates.is_empty() {
                rates.insert(group, group_rates);
            }
        }
        self.tracker.retain(|k| seen.contains(k));
        Ok(rates)
    }
}

impl RateReader for ResctrlRateReader {
    fn read_rates(&mut self) -> Result<GroupRates> {
        self.read_rates_at(Instant::now())
    }
}

/// Merge a reads source with an optional writes source by CCD id. A CCD
/// reported by only one side gets zero for the other.
pub fn merge_reads_writes(reads: &GroupRates, writes: Option<&GroupRates>) -> MbSnapshot {
    let empty = GroupRates::new();
    let writes = writes.unwrap_or(&empty);
    let groups: BTreeSet<QosGroup> = reads.keys().chain(writes.keys()).copied().collect();

    groups
        .into_iter()
        .map(|group| {
            let r = reads.get(&group);
            let w = writes.get(&group);
            let ccds: BTreeSet<CcdId> = r
                .into_iter()
                .flat_map(|m| m.keys())
                .chain(w.into_iter().flat_map(|m| m.keys()))
                .copied()
                .collect();
            let ccd_mb = ccds
                .into_iter()
                .map(|ccd| {
                    let read = r.and_then(|m| m.get(&ccd)).copied().unwrap_or_default();
                    let write = w.and_then(|m| m.get(&ccd)).copied().unwrap_or_default();
                    let total_mb = read.total_mb + write.total_mb;
                    let local_mb = (read.local_or_total() + write.local_or_total()).min(total_mb);
                    (
                        ccd,
                        MbData {
                            reads_mb: read.total_mb,
                            writes_mb: write.total_mb,
                            total_mb,
                            local_mb,
                            remote_mb: total_mb - local_mb,
                        },
                    )
                })
                .collect();
            (group, MbQosGroup::new(ccd_mb))
        })
        .collect()
}

/// Monitor built from a reads source and an optional writes source.
pub struct MbMonitor {
    reads: Box<dyn RateReader>,
    writes: Option<Box<dyn RateReader>>,
}

impl MbMonitor {
    pub fn new(reads: Box<dyn RateReader>, writes: Option<Box<dyn RateReader>>) -> Self {
        MbMonitor { reads, writes }
    }
}

impl Monitor for MbMonitor {
    fn get_mb_qos_groups(&mut self) -> Result<MbSnapshot> {
        let reads = self.reads.read_rates()?;
        let writes = match self.writes.as_mut() {
            Some(w) => Some(w.read_rates()?),
            None => None,
        };
        Ok(merge_reads_writes(&reads, writes.as_ref()))
    }
}
