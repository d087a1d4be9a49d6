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

use std::io::Write;

use tempfile::TempDir;

fn write_config(tempdir: &TempDir, content: &str) -> PathBuf {
    let path = tempdir.path().join("mbctl.conf");
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(true)
        .create(true)
        .open(&path)
        .expect("Fail to open mbctl.conf in tempdir");
    file.write_all(content.as_bytes())
        .expect("Faild to write temp conf file during testing");
    file.flush().expect("Failed to flush during testing");
    path
}

#[test]
fn test_config_default() {
    let config: MbctlConfig = Default::default();
    assert_eq!(
        config.resctrl_root.to_string_lossy(),
        resctrlfs::DEFAULT_RESCTRL_ROOT
    );
    assert_eq!(config.interval(), Duration::from_secs(1));
    assert_eq!(config.rate_staleness(), Duration::from_secs(2));
    assert_eq!(config.policy, PolicyKind::Domain);
    assert_eq!(config.sourcer, SourcerKind::Geometric);
    assert_eq!(config.ease_mode, EaseMode::Half);
    assert_eq!(config.min_domain_quota_mb, 4000);
    assert_eq!(config.mba_granularity_mb, 125);
    assert!(config.topology.packages.is_empty());
    config.validate().expect("Default config should be valid");
}

#[test]
fn test_config_fs_failure() {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let path = tempdir.path();
    match MbctlConfig::load(path) {
        Ok(_) => panic!("Config should not load from a directory"),
        Err(e) => assert_eq!(
            format!("{}", e),
            format!("{} exists and is not a file", path.to_string_lossy())
        ),
    }

    let path = tempdir.path().join("mbctl.config");
    match MbctlConfig::load(&path) {
        Ok(_) => panic!("Config should not load if the non existing path is not default path"),
        Err(e) => assert_eq!(
            format!("{}", e),
            format!("No such file or directory: {}", path.to_string_lossy())
        ),
    }
}

#[test]
fn test_config_load_success() {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(
        &tempdir,
        r#"
        log_dir = '/var/log/mbctl'
        resctrl_root = '/tmp/resctrl'
        interval_ms = 500
        policy = 'unit'
        sourcer = 'proportional'
        ease_mode = 'full'
        ctrl_groups = ['dedicated', 'shared-60', 'shared-50']
        domain_capacity_mb = 30000
        ccd_max_mb = 20000
        # I'm a comment
        something_else = "demacia"

        [[topology.packages]]
        [[topology.packages.numa_nodes]]
        id = 0
        ccds = [0, 1]

        [[topology.packages]]
        [[topology.packages.numa_nodes]]
        id = 1
        ccds = [2, 3]
    "#,
    );

    let config = MbctlConfig::load(&path).expect("Failed to load config");
    assert_eq!(config.log_dir.to_string_lossy(), "/var/log/mbctl");
    assert_eq!(config.resctrl_root.to_string_lossy(), "/tmp/resctrl");
    assert_eq!(config.interval(), Duration::from_millis(500));
    assert_eq!(config.policy, PolicyKind::Unit);
    assert_eq!(config.sourcer, SourcerKind::Proportional);
    assert_eq!(config.ease_mode, EaseMode::Full);
    assert_eq!(config.ctrl_groups, vec!["dedicated", "shared-60", "shared-50"]);
    assert_eq!(config.domain_capacity_mb, 30000);
    assert_eq!(config.ccd_max_mb, 20000);
    // Untouched fields keep their defaults
    assert_eq!(config.ccd_min_mb, defaults::CCD_MIN_MB);
    assert_eq!(
        config.topology,
        TopologyConfig {
            packages: vec![
                PackageConfig {
                    numa_nodes: vec![NumaConfig {
                        id: 0,
                        ccds: vec![0, 1]
                    }]
                },
                PackageConfig {
                    numa_nodes: vec![NumaConfig {
                        id: 1,
                        ccds: vec![2, 3]
                    }]
                },
            ]
        }
    );
}

#[test]
fn test_config_parse_failure() {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(&tempdir, "policy = 'greedy'\n");
    let err = MbctlConfig::load(&path).expect_err("Unknown policy should fail");
    assert!(format!("{}", err).starts_with("Failed to parse config file"));
}

#[test]
fn test_config_validate() {
    let bad = MbctlConfig {
        ccd_min_mb: 5000,
        ccd_max_mb: 4000,
        ..Default::default()
    };
    assert!(bad.validate().is_err());

    let bad = MbctlConfig {
        throttle_threshold_mb: 9000,
        ease_threshold_mb: 8000,
        ..Default::default()
    };
    assert!(bad.validate().is_err());

    let bad = MbctlConfig {
        interval_ms: 3000,
        rate_staleness_ms: 2000,
        ..Default::default()
    };
    assert!(bad.validate().is_err());

    let bad = MbctlConfig {
        ctrl_groups: vec![],
        ..Default::default()
    };
    assert!(bad.validate().is_err());

    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(&tempdir, "mba_granularity_mb = 0\n");
    assert!(MbctlConfig::load(&path).is_err());
}

#[test]
fn test_policy_params() {
    let config = MbctlConfig {
        domain_capacity_mb: 30000,
        ease_mode: EaseMode::Full,
        socket_lounge_mb: 1000,
        ..Default::default()
    };
    let params = config.policy_params();
    assert_eq!(params.domain_capacity_mb, 30000);
    assert_eq!(params.ease_mode, EaseMode::Full);
    assert_eq!(params.socket_lounge_mb, 1000);
    assert_eq!(params.ccd_max_mb, PolicyParams::default().ccd_max_mb);
}
