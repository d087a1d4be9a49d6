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

/// Turns a group-level amount of bandwidth into per-CCD values, keeping
/// every value within `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CcdGroupPlanner {
    min: u64,
    max: u64,
}

impl CcdGroupPlanner {
    pub fn new(min: u64, max: u64) -> Self {
        CcdGroupPlanner {
            min: min.min(max),
            max,
        }
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn clamp(&self, mb: f64) -> u64 {
        if !mb.is_finite() || mb <= self.min as f64 {
            return self.min;
        }
        (mb.round() as u64).clamp(self.min, self.max)
    }

    /// Scale each CCD's current usage by `ratio`.
    pub fn get_proportional_plan(
        &self,
        ratio: f64,
        ccd_mbs: &BTreeMap<CcdId, u64>,
    ) -> BTreeMap<CcdId, u64> {
        ccd_mbs
            .iter()
            .map(|(ccd, mb)| (*ccd, self.clamp(ratio * *mb as f64)))
            .collect()
    }

    /// The same value on every given CCD.
    pub fn get_fixed_plan<'a, I: IntoIterator<Item = &'a CcdId>>(
        &self,
        value: u64,
        ccds: I,
    ) -> BTreeMap<CcdId, u64> {
        ccds.into_iter().map(|ccd| (*ccd, value)).collect()
    }

    /// Split `allocatable` over the CCDs in proportion to their usage, or
    /// evenly when none of them has any.
    pub fn distribute(&self, allocatable: u64, ccd_mbs: &BTreeMap<CcdId, u64>) -> BTreeMap<CcdId, u64> {
        let total: u64 = ccd_mbs.values().sum();
        if total == 0 {
            let even = allocatable as f64 / ccd_mbs.len().max(1) as f64;
            return ccd_mbs.keys().map(|ccd| (*ccd, self.clamp(even))).collect();
        }
        self.get_proportional_plan(allocatable as f64 / total as f64, ccd_mbs)
    }
}
