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

/// Bandwidth of one CCD in MBps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbData {
    pub reads_mb: u64,
    pub writes_mb: u64,
    pub total_mb: u64,
    /// Traffic served by memory attached to the CCD's own domain.
    pub local_mb: u64,
    /// Traffic crossing to another domain's memory.
    pub remote_mb: u64,
}

impl MbData {
    /// Build from total and local traffic; the remote share is derived.
    pub fn from_total_local(total_mb: u64, local_mb: u64) -> Self {
        let local_mb = local_mb.min(total_mb);
        MbData {
            reads_mb: total_mb,
            writes_mb: 0,
            total_mb,
            local_mb,
            remote_mb: total_mb - local_mb,
        }
    }
}

impl std::ops::Add for MbData {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        let total_mb = self.total_mb + other.total_mb;
        let local_mb = (self.local_mb + other.local_mb).min(total_mb);
        MbData {
            reads_mb: self.reads_mb + other.reads_mb,
            writes_mb: self.writes_mb + other.writes_mb,
            total_mb,
            local_mb,
            remote_mb: total_mb - local_mb,
        }
    }
}

impl std::iter::Sum for MbData {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(MbData::default(), |a, b| a + b)
    }
}

/// Per-CCD bandwidth of one QoS group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbQosGroup {
    pub ccds: BTreeSet<CcdId>,
    pub ccd_mb: BTreeMap<CcdId, MbData>,
}

impl MbQosGroup {
    pub fn new(ccd_mb: BTreeMap<CcdId, MbData>) -> Self {
        MbQosGroup {
            ccds: ccd_mb.keys().copied().collect(),
            ccd_mb,
        }
    }

    pub fn insert(&mut self, ccd: CcdId, data: MbData) {
        self.ccds.insert(ccd);
        self.ccd_mb.insert(ccd, data);
    }

    pub fn total_mb(&self) -> u64 {
        self.ccd_mb.values().map(|d| d.total_mb).sum()
    }

    /// Sum over the given CCDs. CCDs without data count as idle.
    pub fn sum_over<'a, I: IntoIterator<Item = &'a CcdId>>(&self, ccds: I) -> MbData {
        ccds.into_iter()
            .filter_map(|ccd| self.ccd_mb.get(ccd))
            .copied()
            .sum()
    }

    pub fn ccd_total(&self, ccd: CcdId) -> u64 {
        self.ccd_mb.get(&ccd).map_or(0, |d| d.total_mb)
    }
}

/// One cycle's view of bandwidth usage, by QoS group.
pub type MbSnapshot = BTreeMap<QosGroup, MbQosGroup>;

/// The lowest priority group present, which absorbs whatever capacity is
/// left after the others are served.
pub fn leaf_group(snapshot: &MbSnapshot) -> Option<QosGroup> {
    snapshot.keys().next().copied()
}

/// Total usage of one CCD over all groups.
pub fn ccd_total_mb(snapshot: &MbSnapshot, ccd: CcdId) -> u64 {
    snapshot.values().map(|g| g.ccd_total(ccd)).sum()
}
