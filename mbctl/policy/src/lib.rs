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

#![deny(clippy::all)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use model::CcdId;
use model::DomainId;
use model::DomainManager;
use model::MbDomain;
use model::MbSnapshot;
use model::NodeId;
use model::QosGroup;
use model::leaf_group;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;

pub mod adjuster;
pub mod ccd;
pub mod domain_policy;
pub mod incubation;
pub mod plan;
pub mod registry;
pub mod sourcer;
pub mod unit;
pub mod unit_policy;

#[cfg(test)]
mod test;

pub use adjuster::*;
pub use ccd::*;
pub use domain_policy::*;
pub use incubation::*;
pub use plan::*;
pub use registry::*;
pub use sourcer::*;
pub use unit::*;
pub use unit_policy::*;

pub mod defaults {
    pub const DOMAIN_CAPACITY_MB: u64 = 120_000;
    pub const CCD_MIN_MB: u64 = 4_000;
    /// 2048 MBA steps of 125 MBps, i.e. no limit.
    pub const CCD_MAX_MB: u64 = 256_000;
    pub const EASE_THRESHOLD_MB: u64 = 8_000;
    pub const THROTTLE_THRESHOLD_MB: u64 = 4_000;
    pub const MIN_DOMAIN_QUOTA_MB: u64 = 4_000;
    pub const SOCKET_LOUNGE_MB: u64 = 6_000;
    pub const RESERVED_PER_NUMA_MB: u64 = 30_000;
    pub const SOCKET_NODE_MAX_MB: u64 = 60_000;
    pub const INCUBATION_FLOOR_PER_CCD_MB: u64 = 8_000;

    // Relative shares kept by each class when free bandwidth shrinks.
    pub const SHARED_WEIGHT: u64 = 5;
    pub const RECLAIMED_WEIGHT: u64 = 1;
    pub const SYSTEM_WEIGHT: u64 = 5;
}

/// Which policy drives the control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Two-level cross-domain plus per-domain throttle/ease policy.
    Domain,
    /// Unit (NUMA node grain) preempt/soft policy.
    Unit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcerKind {
    Geometric,
    Proportional,
}

/// How far a single ease step moves towards the full target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EaseMode {
    Half,
    Full,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Domain => write!(f, "domain"),
            PolicyKind::Unit => write!(f, "unit"),
        }
    }
}

/// Bounds and thresholds shared by all policies.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyParams {
    pub domain_capacity_mb: u64,
    pub ccd_min_mb: u64,
    pub ccd_max_mb: u64,
    pub ease_threshold_mb: u64,
    pub throttle_threshold_mb: u64,
    pub ease_mode: EaseMode,
    pub sourcer: SourcerKind,
    pub min_domain_quota_mb: u64,
    pub socket_lounge_mb: u64,
    pub reserved_per_numa_mb: u64,
    pub socket_node_max_mb: u64,
    pub incubation_floor_per_ccd_mb: u64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        PolicyParams {
            domain_capacity_mb: defaults::DOMAIN_CAPACITY_MB,
            ccd_min_mb: defaults::CCD_MIN_MB,
            ccd_max_mb: defaults::CCD_MAX_MB,
            ease_threshold_mb: defaults::EASE_THRESHOLD_MB,
            throttle_threshold_mb: defaults::THROTTLE_THRESHOLD_MB,
            ease_mode: EaseMode::Half,
            sourcer: SourcerKind::Geometric,
            min_domain_quota_mb: defaults::MIN_DOMAIN_QUOTA_MB,
            socket_lounge_mb: defaults::SOCKET_LOUNGE_MB,
            reserved_per_numa_mb: defaults::RESERVED_PER_NUMA_MB,
            socket_node_max_mb: defaults::SOCKET_NODE_MAX_MB,
            incubation_floor_per_ccd_mb: defaults::INCUBATION_FLOOR_PER_CCD_MB,
        }
    }
}

impl PolicyParams {
    pub fn planner(&self) -> CcdGroupPlanner {
        CcdGroupPlanner::new(self.ccd_min_mb, self.ccd_max_mb)
    }

    pub fn thresholds(&self) -> AdjustThresholds {
        AdjustThresholds {
            ease_threshold_mb: self.ease_threshold_mb,
            throttle_threshold_mb: self.throttle_threshold_mb,
            ease_mode: self.ease_mode,
        }
    }
}

/// Everything one cycle wants delivered: explicit per-CCD values plus
/// node-level bounds that are spread over CCDs at delivery time. Explicit
/// plan entries take precedence.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MbDecision {
    pub plan: MbPlan,
    pub allocs: Vec<MbAlloc>,
}

impl MbDecision {
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty() && self.allocs.is_empty()
    }
}

/// A bandwidth allocation policy. `Ok(None)` leaves every limit as it is.
pub trait MbPolicy: Send {
    fn name(&self) -> &'static str;

    fn get_plan(
        &mut self,
        domains: &DomainManager,
        snapshot: &MbSnapshot,
        now: Instant,
    ) -> Result<Option<MbDecision>>;
}
