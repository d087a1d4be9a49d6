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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustThresholds {
    pub ease_threshold_mb: u64,
    pub throttle_threshold_mb: u64,
    pub ease_mode: EaseMode,
}

/// Steps one group's per-CCD limits within a domain towards its capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainMbAdjuster {
    /// Capacity cannot even cover the per-CCD minimum: pin every CCD there.
    ExtremeThrottle,
    /// Halve the group, but never beyond what keeps the ease headroom.
    HalfThrottle,
    /// Jump straight to capacity minus the ease headroom.
    FullEase,
    /// Move halfway between usage and the full ease target.
    HalfEase,
}

impl DomainMbAdjuster {
    /// Choose an adjuster for a group whose per-CCD usage is `ccd_mbs`,
    /// given `capacity` MBps to live in. `None` means the current limits
    /// are fine.
    pub fn select(
        capacity: u64,
        ccd_mbs: &BTreeMap<CcdId, u64>,
        planner: &CcdGroupPlanner,
        thresholds: &AdjustThresholds,
    ) -> Option<Self> {
        if ccd_mbs.is_empty() {
            return None;
        }
        if capacity <= planner.min() * ccd_mbs.len() as u64 {
            return Some(DomainMbAdjuster::ExtremeThrottle);
        }
        let usage: u64 = ccd_mbs.values().sum();
        let free = capacity as i64 - usage as i64;
        if free < thresholds.throttle_threshold_mb as i64 {
            return Some(DomainMbAdjuster::HalfThrottle);
        }
        if free >= thresholds.ease_threshold_mb as i64 {
            return Some(match thresholds.ease_mode {
                EaseMode::Full => DomainMbAdjuster::FullEase,
                EaseMode::Half => DomainMbAdjuster::HalfEase,
            });
        }
        None
    }

    pub fn get_plan(
        &self,
        capacity: u64,
        ccd_mbs: &BTreeMap<CcdId, u64>,
        planner: &CcdGroupPlanner,
        ease_threshold_mb: u64,
    ) -> Option<BTreeMap<CcdId, u64>> {
        let usage: u64 = ccd_mbs.values().sum();
        let full_target = capacity.saturating_sub(ease_threshold_mb);
        match self {
            DomainMbAdjuster::ExtremeThrottle => {
                Some(planner.get_fixed_plan(planner.min(), ccd_mbs.keys()))
            }
            DomainMbAdjuster::HalfThrottle => {
                let allocatable = (usage / 2).min(full_target);
                if allocatable == 0 {
                    return Some(planner.get_fixed_plan(planner.min(), ccd_mbs.keys()));
                }
                Some(planner.distribute(allocatable, ccd_mbs))
            }
            DomainMbAdjuster::FullEase => {
                if full_target == 0 {
                    return None;
                }
                Some(planner.distribute(full_target, ccd_mbs))
            }
            DomainMbAdjuster::HalfEase => {
                if full_target == 0 {
                    return None;
                }
                Some(planner.distribute((usage + full_target) / 2, ccd_mbs))
            }
        }
    }
}

impl fmt::Display for DomainMbAdjuster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainMbAdjuster::ExtremeThrottle => "extreme-throttle",
            DomainMbAdjuster::HalfThrottle => "half-throttle",
            DomainMbAdjuster::FullEase => "full-ease",
            DomainMbAdjuster::HalfEase => "half-ease",
        };
        write!(f, "{}", name)
    }
}
