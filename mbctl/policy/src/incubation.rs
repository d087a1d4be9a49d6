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

/// MBps held back for CCDs still incubating a newly admitted pod: on each
/// one, whatever part of `floor_per_ccd` its dedicated traffic does not
/// cover yet.
pub fn incubation_reservation<'a, I: IntoIterator<Item = &'a CcdId>>(
    incubated: I,
    snapshot: &MbSnapshot,
    floor_per_ccd: u64,
) -> u64 {
    let dedicated = snapshot.get(&QosGroup::Dedicated);
    incubated
        .into_iter()
        .map(|ccd| floor_per_ccd.saturating_sub(dedicated.map_or(0, |g| g.ccd_total(*ccd))))
        .sum()
}

/// Drop expired incubation entries and return the CCDs still incubating.
pub fn live_incubates(domain: &MbDomain, now: Instant) -> BTreeSet<CcdId> {
    domain.cleanse_incubates_at(now);
    domain.clone_incubates().into_keys().collect()
}
