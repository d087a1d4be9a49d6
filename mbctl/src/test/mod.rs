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

use std::io::Write;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use agent::admission::AllocationRequest;
use agent::admission::NUMA_BINDING_ANNOTATION;
use agent::admission::NUMA_EXCLUSIVE_ANNOTATION;
use agent::admission::QOS_LEVEL_ANNOTATION;
use config::NumaConfig;
use config::PackageConfig;
use config::TopologyConfig;
use maplit::btreemap;
use maplit::btreeset;
use model::MbSnapshot;
use model::Monitor;
use policy::MbDecision;
use policy::MbPolicy;
use tempfile::TempDir;

use super::*;

fn numa(id: usize, ccds: Vec<usize>) -> NumaConfig {
    NumaConfig { id, ccds }
}

#[test]
fn test_opts() {
    Opt::command().debug_assert();

    let opts = Opt::try_parse_from(["mbctl"]).expect("Failed to parse");
    assert_eq!(opts.config, PathBuf::from(config::MBCTL_DEFAULT_CONF));
    assert!(opts.cmd.is_none());

    let opts = Opt::try_parse_from(["mbctl", "--debug", "run", "--dry-run"]).expect("Failed to parse");
    assert!(opts.debug);
    assert!(matches!(opts.cmd, Some(Command::Run { dry_run: true })));

    assert!(Opt::try_parse_from(["mbctl", "plan", "--dry-run"]).is_err());
}

#[test]
fn test_topology_from_config() {
    let mbctl_config = MbctlConfig {
        topology: TopologyConfig {
            packages: vec![
                PackageConfig {
                    numa_nodes: vec![numa(0, vec![0, 1]), numa(1, vec![2, 3])],
                },
                PackageConfig {
                    numa_nodes: vec![numa(2, vec![4, 5])],
                },
            ],
        },
        ..Default::default()
    };
    let topology =
        build_topology(&mbctl_config, Path::new("/nonexistent")).expect("Failed to build topology");
    assert_eq!(topology.packages(), 2);
    assert_eq!(topology.numas_in_package(0), Some(&[0, 1][..]));
    assert_eq!(topology.dies_in_numa(2), Some(&btreeset! {4, 5}));
    assert_eq!(topology.node_package(1), Some(0));
    assert_eq!(topology.ccd_node(5), Some(2));
}

#[test]
fn test_topology_config_errors() {
    let twice = MbctlConfig {
        topology: TopologyConfig {
            packages: vec![
                PackageConfig {
                    numa_nodes: vec![numa(0, vec![0, 1])],
                },
                PackageConfig {
                    numa_nodes: vec![numa(0, vec![2, 3])],
                },
            ],
        },
        ..Default::default()
    };
    assert!(build_topology(&twice, Path::new("/nonexistent")).is_err());

    // Nothing configured and nothing to discover.
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    assert!(build_topology(&MbctlConfig::default(), tempdir.path()).is_err());
}

#[test]
fn test_parse_ctrl_groups() {
    let groups = parse_ctrl_groups(&[
        "dedicated".to_string(),
        "shared-30".to_string(),
        "reclaimed".to_string(),
    ])
    .expect("Failed to parse");
    assert_eq!(
        groups,
        btreeset! {QosGroup::Reclaimed, QosGroup::Shared(30), QosGroup::Dedicated}
    );
    assert!(parse_ctrl_groups(&["gold".to_string()]).is_err());
}

#[test]
fn test_default_ctrl_groups_parse() {
    let groups = parse_ctrl_groups(&MbctlConfig::default().ctrl_groups).expect("Failed to parse");
    assert!(groups.contains(&QosGroup::Dedicated));
}

#[test]
fn test_create_log_dir() {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let dir = tempdir.path().join("a/b");
    create_log_dir(&dir).expect("Failed to create log dir");
    assert!(dir.is_dir());
    create_log_dir(&dir).expect("Existing dir should be accepted");

    let file = tempdir.path().join("file");
    std::fs::File::create(&file)
        .and_then(|mut f| f.write_all(b"x"))
        .expect("Failed to write file");
    assert!(create_log_dir(&file).is_err());
}

#[test]
fn test_logging_setup() {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let path = tempdir.path().join(LOG_FILE_NAME);
    let logger = logging::setup(&path, false);
    info!(logger, "hello from test");
    drop(logger);
    let content = std::fs::read_to_string(&path).expect("Failed to read log");
    assert!(content.contains("hello from test"));
}

fn test_logger() -> slog::Logger {
    common::logutil::get_logger()
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

struct CountingMonitor {
    cycles: Arc<AtomicUsize>,
}

impl Monitor for CountingMonitor {
    fn get_mb_qos_groups(&mut self) -> Result<MbSnapshot> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(MbSnapshot::new())
    }
}

struct IdlePolicy {
    panic: bool,
}

impl MbPolicy for IdlePolicy {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn get_plan(
        &mut self,
        _domains: &DomainManager,
        _snapshot: &MbSnapshot,
        _now: Instant,
    ) -> Result<Option<MbDecision>> {
        if self.panic {
            panic!("policy failure");
        }
        Ok(None)
    }
}

/// An agent over two single-node packages whose loop only runs on start
/// and when triggered.
fn test_agent(cycles: Arc<AtomicUsize>, panic: bool) -> Agent {
    let logger = test_logger();
    let topology = DieTopology::new(
        btreemap! {0 => vec![0], 1 => vec![1]},
        btreemap! {0 => btreeset! {0, 1}, 1 => btreeset! {2, 3}},
    )
    .expect("Failed to build topology");
    let domains = Arc::new(
        DomainManager::new(&topology, Duration::from_secs(10)).expect("Failed to build domains"),
    );
    let controller = Controller::new(
        logger.clone(),
        domains.clone(),
        Box::new(CountingMonitor { cycles }),
        Box::new(IdlePolicy { panic }),
        Deliverer::new(logger.clone(), Box::new(DryRunSetter::new(logger))),
        Duration::from_secs(3600),
    );
    Agent {
        controller,
        domains,
        pool: AppPool::shared(),
    }
}

#[test]
fn test_admission_shares_pool_and_triggers_cycle() {
    let cycles = Arc::new(AtomicUsize::new(0));
    let agent = test_agent(cycles.clone(), false);
    let pool = agent.pool.clone();
    let (mut handle, admitter) = agent.start(&test_logger()).expect("Failed to start agent");
    assert!(wait_until(|| cycles.load(Ordering::SeqCst) >= 1));

    let request = AllocationRequest {
        pod_uid: "pod-a".into(),
        pod_name: "socket-a".into(),
        annotations: btreemap! {
            QOS_LEVEL_ANNOTATION.to_string() => "dedicated".to_string(),
            NUMA_BINDING_ANNOTATION.to_string() => "true".to_string(),
            NUMA_EXCLUSIVE_ANNOTATION.to_string() => "true".to_string(),
        },
        hint_nodes: btreeset! {1},
    };
    let response = admitter.allocate(&request).expect("Failed to admit pod");
    assert_eq!(response.closid, "dedicated");
    assert!(pool.lock().unwrap().unit("pod-a").is_some());
    // The preemption asks the controller for a cycle long before the
    // hour-long interval is up.
    assert!(wait_until(|| cycles.load(Ordering::SeqCst) >= 2));

    handle.stop();
    assert_eq!(handle.state(), ControllerState::Stopped);
}

#[test]
fn test_wait_for_stop_outlives_controller() {
    let logger = test_logger();
    let agent = test_agent(Arc::new(AtomicUsize::new(0)), true);
    let (handle, _admitter) = agent.start(&logger).expect("Failed to start agent");
    assert!(wait_until(|| handle.state() == ControllerState::Stopped));

    let (sender, errs) = channel();
    let signal = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        sender
            .send(anyhow!(StopSignal { signal: 15 }))
            .expect("Failed to send signal");
    });
    // Many health checks see the stopped controller before the signal.
    let e = wait_for_stop(&logger, &errs, &handle, Duration::from_millis(10));
    assert!(e.is::<StopSignal>());
    signal.join().expect("Signal thread panicked");
}
