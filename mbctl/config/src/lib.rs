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

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use policy::EaseMode;
use policy::PolicyKind;
use policy::PolicyParams;
use policy::SourcerKind;
use policy::defaults;
use serde::Deserialize;
use serde::Serialize;

#[cfg(test)]
mod test;

pub const MBCTL_DEFAULT_CONF: &str = "/etc/mbctl/mbctl.conf";
const MBCTL_DEFAULT_LOG_DIR: &str = "/var/log/mbctl";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
// If value is missing during deserialization, use the Default::default()
#[serde(default)]
pub struct MbctlConfig {
    pub log_dir: PathBuf,
    pub resctrl_root: PathBuf,
    /// Period of the control loop.
    pub interval_ms: u64,
    /// Counter samples further apart than this do not yield a rate.
    pub rate_staleness_ms: u64,
    /// resctrl control groups that are monitored and controlled.
    pub ctrl_groups: Vec<String>,
    pub policy: PolicyKind,
    pub sourcer: SourcerKind,
    pub ease_mode: EaseMode,
    pub domain_capacity_mb: u64,
    pub ccd_min_mb: u64,
    pub ccd_max_mb: u64,
    pub ease_threshold_mb: u64,
    pub throttle_threshold_mb: u64,
    pub min_domain_quota_mb: u64,
    pub socket_lounge_mb: u64,
    pub reserved_per_numa_mb: u64,
    pub socket_node_max_mb: u64,
    pub incubation_interval_ms: u64,
    pub incubation_floor_per_ccd_mb: u64,
    pub mba_granularity_mb: u64,
    pub mba_max_value: u64,
    pub topology: TopologyConfig,
}

/// Packages in id order, each listing its NUMA nodes and their CCDs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    pub packages: Vec<PackageConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PackageConfig {
    pub numa_nodes: Vec<NumaConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NumaConfig {
    pub id: usize,
    pub ccds: Vec<usize>,
}

impl Default for MbctlConfig {
    fn default() -> Self {
        MbctlConfig {
            log_dir: std::env::var_os("LOGS_DIRECTORY")
                .map_or(MBCTL_DEFAULT_LOG_DIR.into(), PathBuf::from),
            resctrl_root: resctrlfs::DEFAULT_RESCTRL_ROOT.into(),
            interval_ms: 1000,
            rate_staleness_ms: 2000,
            ctrl_groups: ["dedicated", "system", "shared-50", "shared-30", "reclaimed"]
                .iter()
                .map(|g| g.to_string())
                .collect(),
            policy: PolicyKind::Domain,
            sourcer: SourcerKind::Geometric,
            ease_mode: EaseMode::Half,
            domain_capacity_mb: defaults::DOMAIN_CAPACITY_MB,
            ccd_min_mb: defaults::CCD_MIN_MB,
            ccd_max_mb: defaults::CCD_MAX_MB,
            ease_threshold_mb: defaults::EASE_THRESHOLD_MB,
            throttle_threshold_mb: defaults::THROTTLE_THRESHOLD_MB,
            min_domain_quota_mb: defaults::MIN_DOMAIN_QUOTA_MB,
            socket_lounge_mb: defaults::SOCKET_LOUNGE_MB,
            reserved_per_numa_mb: defaults::RESERVED_PER_NUMA_MB,
            socket_node_max_mb: defaults::SOCKET_NODE_MAX_MB,
            incubation_interval_ms: 10_000,
            incubation_floor_per_ccd_mb: defaults::INCUBATION_FLOOR_PER_CCD_MB,
            mba_granularity_mb: resctrlfs::DEFAULT_MB_GRANULARITY,
            mba_max_value: resctrlfs::DEFAULT_MB_MAX_VALUE,
            topology: TopologyConfig::default(),
        }
    }
}

impl MbctlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config = match path.exists() {
            true if !path.is_file() => bail!("{} exists and is not a file", path.to_string_lossy()),
            true => MbctlConfig::load_exists(path)?,
            false if path.to_string_lossy() == MBCTL_DEFAULT_CONF => Default::default(),
            false => bail!("No such file or directory: {}", path.to_string_lossy()),
        };
        config.validate()?;
        Ok(config)
    }

    fn load_exists(path: &Path) -> Result<Self> {
        let string_config = match fs::read_to_string(path) {
            Ok(sc) => sc,
            Err(e) => {
                bail!(
                    "Failed to read from config file {}: {}",
                    path.to_string_lossy(),
                    e
                );
            }
        };

        match toml::from_str(string_config.as_str()) {
            Ok(mc) => Ok(mc),
            Err(e) => {
                bail!(
                    "Failed to parse config file {}: {}\n{}",
                    path.to_string_lossy(),
                    e,
                    string_config
                );
            }
        }
    }

    /// Reject settings the control loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            bail!("interval_ms must be positive");
        }
        if self.rate_staleness_ms < self.interval_ms {
            bail!(
                "rate_staleness_ms ({}) must not be shorter than interval_ms ({})",
                self.rate_staleness_ms,
                self.interval_ms
            );
        }
        if self.ccd_min_mb > self.ccd_max_mb {
            bail!(
                "ccd_min_mb ({}) exceeds ccd_max_mb ({})",
                self.ccd_min_mb,
                self.ccd_max_mb
            );
        }
        if self.throttle_threshold_mb > self.ease_threshold_mb {
            bail!(
                "throttle_threshold_mb ({}) exceeds ease_threshold_mb ({})",
                self.throttle_threshold_mb,
                self.ease_threshold_mb
            );
        }
        if self.mba_granularity_mb == 0 || self.mba_max_value == 0 {
            bail!("mba_granularity_mb and mba_max_value must be positive");
        }
        if self.ctrl_groups.is_empty() {
            bail!("ctrl_groups must not be empty");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn rate_staleness(&self) -> Duration {
        Duration::from_millis(self.rate_staleness_ms)
    }

    pub fn incubation_interval(&self) -> Duration {
        Duration::from_millis(self.incubation_interval_ms)
    }

    pub fn policy_params(&self) -> PolicyParams {
        PolicyParams {
            domain_capacity_mb: self.domain_capacity_mb,
            ccd_min_mb: self.ccd_min_mb,
            ccd_max_mb: self.ccd_max_mb,
            ease_threshold_mb: self.ease_threshold_mb,
            throttle_threshold_mb: self.throttle_threshold_mb,
            ease_mode: self.ease_mode,
            sourcer: self.sourcer,
            min_domain_quota_mb: self.min_domain_quota_mb,
            socket_lounge_mb: self.socket_lounge_mb,
            reserved_per_numa_mb: self.reserved_per_numa_mb,
            socket_node_max_mb: self.socket_node_max_mb,
            incubation_floor_per_ccd_mb: self.incubation_floor_per_ccd_mb,
        }
    }
}
