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

/// Per-group, per-CCD bandwidth limits in MBps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbPlan {
    groups: BTreeMap<QosGroup, BTreeMap<CcdId, u64>>,
}

impl MbPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_group(group: QosGroup, ccd_mbs: BTreeMap<CcdId, u64>) -> Self {
        let mut plan = Self::new();
        plan.insert_group(group, ccd_mbs);
        plan
    }

    pub fn insert(&mut self, group: QosGroup, ccd: CcdId, mb: u64) {
        self.groups.entry(group).or_default().insert(ccd, mb);
    }

    pub fn insert_group(&mut self, group: QosGroup, ccd_mbs: BTreeMap<CcdId, u64>) {
        if ccd_mbs.is_empty() {
            return;
        }
        self.groups.entry(group).or_default().extend(ccd_mbs);
    }

    pub fn get(&self, group: QosGroup, ccd: CcdId) -> Option<u64> {
        self.groups.get(&group)?.get(&ccd).copied()
    }

    pub fn group(&self, group: QosGroup) -> Option<&BTreeMap<CcdId, u64>> {
        self.groups.get(&group)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&QosGroup, &BTreeMap<CcdId, u64>)> {
        self.groups.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Union of both plans. Where both set the same group and CCD, `self`
    /// wins.
    pub fn merge(mut self, other: &MbPlan) -> MbPlan {
        for (group, ccds) in &other.groups {
            let entry = self.groups.entry(*group).or_default();
            for (ccd, mb) in ccds {
                entry.entry(*ccd).or_insert(*mb);
            }
        }
        self
    }

    /// Merge partial plans in priority order, earlier ones winning. Returns
    /// `None` only when every part is `None`.
    pub fn merge_partials<I: IntoIterator<Item = Option<MbPlan>>>(parts: I) -> Option<MbPlan> {
        parts
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<MbPlan>, part| match acc {
                Some(acc) => Some(acc.merge(&part)),
                None => Some(part),
            })
    }
}

impl fmt::Display for MbPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (group, ccds) in &self.groups {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}:[", group)?;
            let mut sep = "";
            for (ccd, mb) in ccds {
                write!(f, "{}{}={}", sep, ccd, mb)?;
                sep = ",";
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// A bandwidth bound for the traffic of one control group on a set of NUMA
/// nodes. The deliverer splits it evenly over the nodes, then over each
/// node's CCDs by their current usage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbAlloc {
    pub unit_id: String,
    pub ctrl_group: QosGroup,
    pub nodes: BTreeSet<NodeId>,
    pub mb_upper_bound: u64,
}
