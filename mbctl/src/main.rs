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
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use agent::admission::PodAdmitter;
use agent::controller::Controller;
use agent::controller::ControllerHandle;
use agent::controller::ControllerState;
use agent::deliver::Deliverer;
use agent::deliver::DryRunSetter;
use agent::deliver::MbSetter;
use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use clap_complete::Shell;
use clap_complete::generate;
use config::MbctlConfig;
use model::CcdId;
use model::DieTopology;
use model::DomainId;
use model::DomainManager;
use model::MbMonitor;
use model::NodeId;
use model::QosGroup;
use model::ResctrlRateReader;
use policy::AppPool;
use policy::PolicyDeps;
use policy::PolicyRegistry;
use policy::SharedAppPool;
use resctrlfs::ResctrlReader;
use resctrlfs::ResctrlWriter;
use signal_hook::iterator::Signals;
use slog::error;
use slog::info;

mod logging;
#[cfg(test)]
mod test;

const LOG_FILE_NAME: &str = "mbctl.log";
const SYSFS_ROOT: &str = "/sys";

/// How often `run` checks that the controller is still alive.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "mbctl", about = "Node memory bandwidth controller")]
struct Opt {
    #[arg(long, default_value = config::MBCTL_DEFAULT_CONF)]
    config: PathBuf,
    #[arg(short, long)]
    debug: bool,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control loop (default)
    Run {
        /// Log bandwidth limits instead of writing them to resctrl
        #[arg(long)]
        dry_run: bool,
    },
    /// Sample bandwidth over one interval and print the plan the policy
    /// would apply, without applying it
    Plan,
    #[command(hide = true)]
    GenerateCompletions {
        /// Which shell to generate completions for
        #[arg(short, long, value_enum)]
        shell: Shell,
        /// File to write to, stdout if not given
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn create_log_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        bail!("{} exists and is not a directory", path.to_string_lossy());
    }

    if !path.is_dir() {
        fs::create_dir_all(path).with_context(|| {
            format!("Failed to create dir {}\nTry sudo.", path.to_string_lossy())
        })?;
    }

    Ok(())
}

/// Special Error that indicates the program should stop now. It represents an
/// actual signal, e.g. SIGINT, SIGTERM, that is handled by mbctl and thus
/// mbctl can shutdown gracefully.
#[derive(Clone, Debug)]
struct StopSignal {
    signal: i32,
}

impl std::error::Error for StopSignal {}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stopped by signal: {}", self.signal)
    }
}

fn run<F>(debug: bool, mbctl_config: &MbctlConfig, command: F) -> i32
where
    F: FnOnce(&MbctlConfig, slog::Logger, Receiver<Error>) -> Result<()>,
{
    let (err_sender, err_receiver) = channel();

    if let Err(e) = create_log_dir(&mbctl_config.log_dir) {
        eprintln!("{:#}", e);
        return 1;
    }

    let logger = logging::setup(&mbctl_config.log_dir.join(LOG_FILE_NAME), debug);
    setup_log_on_panic(logger.clone());

    match Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM]) {
        Ok(mut signals) => {
            let sig_logger = logger.clone();
            let spawned = thread::Builder::new()
                .name("sighandler".to_owned())
                .spawn(move || {
                    let mut term_now = false;
                    for signal in signals.forever() {
                        if term_now {
                            error!(sig_logger, "mbctl didn't stop in time. Terminate now!");
                            std::process::exit(1);
                        }
                        term_now = true;
                        error!(sig_logger, "Stop signal received: {}, exiting.", signal);
                        if err_sender.send(anyhow!(StopSignal { signal })).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                error!(logger, "Failed to spawn signal handler: {:#}", e);
                return 1;
            }
        }
        Err(e) => {
            error!(logger, "{:#}", e);
            return 1;
        }
    }

    let res = command(mbctl_config, logger.clone(), err_receiver);

    match res {
        Ok(_) => 0,
        Err(e) if e.is::<StopSignal>() => {
            error!(logger, "{:#}", e);
            0
        }
        Err(e) => {
            error!(
                logger,
                "\n\
                ----------------- Detected unclean exit ---------------------\n\
                Error Message: {:#}\n\
                -------------------------------------------------------------",
                e
            );
            1
        }
    }
}

fn main() {
    let opts = Opt::parse();
    let debug = opts.debug;
    let mbctl_config = match MbctlConfig::load(&opts.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{:#}", e);
            exit(1);
        }
    };

    let cmd = opts.cmd.unwrap_or(Command::Run { dry_run: false });
    let rc = match cmd {
        Command::Run { dry_run } => run(debug, &mbctl_config, |mbctl_config, logger, errs| {
            run_controller(mbctl_config, logger, errs, dry_run)
        }),
        Command::Plan => run(debug, &mbctl_config, |mbctl_config, logger, _errs| {
            print_plan(mbctl_config, logger)
        }),
        Command::GenerateCompletions { shell, output } => {
            match generate_completions(shell, output) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{:#}", e);
                    1
                }
            }
        }
    };
    exit(rc);
}

/// Topology from the config file, or from sysfs when the config names no
/// packages.
fn build_topology(mbctl_config: &MbctlConfig, sys: &Path) -> Result<DieTopology> {
    let packages = &mbctl_config.topology.packages;
    if packages.is_empty() {
        return DieTopology::from_sysfs(sys).context("Failed to discover topology");
    }

    let mut numas: BTreeMap<DomainId, Vec<NodeId>> = BTreeMap::new();
    let mut dies: BTreeMap<NodeId, BTreeSet<CcdId>> = BTreeMap::new();
    for (package, package_config) in packages.iter().enumerate() {
        numas.insert(
            package,
            package_config.numa_nodes.iter().map(|n| n.id).collect(),
        );
        for numa in &package_config.numa_nodes {
            if dies
                .insert(numa.id, numa.ccds.iter().copied().collect())
                .is_some()
            {
                bail!("NUMA node {} is configured twice", numa.id);
            }
        }
    }
    DieTopology::new(numas, dies).context("Invalid topology in config")
}

fn parse_ctrl_groups(names: &[String]) -> Result<BTreeSet<QosGroup>> {
    names
        .iter()
        .map(|name| {
            name.parse::<QosGroup>()
                .with_context(|| format!("Invalid control group {}", name))
        })
        .collect()
}

/// The controller plus the state it shares with pod admission.
struct Agent {
    controller: Controller,
    domains: Arc<DomainManager>,
    pool: SharedAppPool,
}

impl Agent {
    /// Start the control loop and the admission hook feeding it. Both see
    /// the same domains and app pool, and admissions that preempt nodes
    /// trigger an immediate cycle.
    fn start(self, logger: &slog::Logger) -> Result<(ControllerHandle, PodAdmitter)> {
        let handle = self.controller.start()?;
        let admitter =
            PodAdmitter::new(logger.clone(), self.domains, self.pool, handle.trigger());
        Ok((handle, admitter))
    }
}

fn build_agent(
    mbctl_config: &MbctlConfig,
    logger: &slog::Logger,
    dry_run: bool,
) -> Result<Agent> {
    let topology = build_topology(mbctl_config, Path::new(SYSFS_ROOT))?;
    let domains = Arc::new(DomainManager::new(
        &topology,
        mbctl_config.incubation_interval(),
    )?);
    info!(
        logger,
        "Topology loaded";
        "domains" => domains.len(),
        "ccds" => topology.all_ccds().count(),
    );

    let groups = parse_ctrl_groups(&mbctl_config.ctrl_groups)?;
    let reader = ResctrlReader::new(mbctl_config.resctrl_root.clone(), true)
        .context("Failed to open resctrl for monitoring")?;
    let monitor = MbMonitor::new(
        Box::new(ResctrlRateReader::new(
            logger.clone(),
            reader,
            groups.clone(),
            mbctl_config.rate_staleness(),
        )),
        None,
    );

    let pool = AppPool::shared();
    let policy = PolicyRegistry::default().build(
        mbctl_config.policy,
        PolicyDeps {
            logger: logger.clone(),
            params: mbctl_config.policy_params(),
            pool: pool.clone(),
        },
    )?;

    let setter: Box<dyn MbSetter> = if dry_run {
        Box::new(DryRunSetter::new(logger.clone()))
    } else {
        let writer = ResctrlWriter::new(
            mbctl_config.resctrl_root.clone(),
            mbctl_config.mba_granularity_mb,
            mbctl_config.mba_max_value,
            true,
        )
        .context("Failed to open resctrl for allocation")?;
        for group in &groups {
            writer
                .ensure_ctrl_group(&group.ctrl_group())
                .with_context(|| format!("Failed to create control group {}", group))?;
        }
        Box::new(writer)
    };

    let controller = Controller::new(
        logger.clone(),
        domains.clone(),
        Box::new(monitor),
        policy,
        Deliverer::new(logger.clone(), setter),
        mbctl_config.interval(),
    );
    Ok(Agent {
        controller,
        domains,
        pool,
    })
}

fn run_controller(
    mbctl_config: &MbctlConfig,
    logger: slog::Logger,
    errs: Receiver<Error>,
    dry_run: bool,
) -> Result<()> {
    let agent = build_agent(mbctl_config, &logger, dry_run)?;
    let (mut handle, admitter) = agent.start(&logger)?;
    info!(
        logger,
        "mbctl started";
        "policy" => mbctl_config.policy.to_string(),
        "dry_run" => dry_run,
    );

    let e = wait_for_stop(&logger, &errs, &handle, HEALTH_CHECK_INTERVAL);
    drop(admitter);
    handle.stop();
    Err(e)
}

/// Block until the signal handler reports. A controller that stopped on
/// its own is logged once; mbctl keeps serving with the last limits
/// written until told to exit.
fn wait_for_stop(
    logger: &slog::Logger,
    errs: &Receiver<Error>,
    handle: &ControllerHandle,
    check_interval: Duration,
) -> Error {
    let mut reported = false;
    loop {
        match errs.recv_timeout(check_interval) {
            Ok(e) => return e,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return anyhow!("Signal handler is gone"),
        }
        if !reported && handle.state() == ControllerState::Stopped {
            error!(
                logger,
                "Controller stopped unexpectedly, bandwidth limits are no longer adjusted"
            );
            reported = true;
        }
    }
}

/// Rates need two samples, so the policy runs once to prime the monitor and
/// again one interval later.
fn print_plan(mbctl_config: &MbctlConfig, logger: slog::Logger) -> Result<()> {
    let mut controller = build_agent(mbctl_config, &logger, true)?.controller;
    controller.plan_once(Instant::now())?;
    thread::sleep(mbctl_config.interval());
    let (snapshot, decision) = controller.plan_once(Instant::now())?;

    let out = serde_json::json!({
        "snapshot": snapshot
            .iter()
            .map(|(group, mb)| (group.to_string(), mb.total_mb()))
            .collect::<BTreeMap<_, _>>(),
        "decision": decision,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn generate_completions(shell: Shell, output: Option<PathBuf>) -> Result<()> {
    let mut file: Box<dyn io::Write> = match output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(io::stdout()),
    };

    let mut app = Opt::command();
    generate(shell, &mut app, "mbctl", &mut file);
    Ok(())
}

#[cfg(feature = "enable_backtrace")]
pub fn get_backtrace() -> impl std::fmt::Display {
    std::backtrace::Backtrace::force_capture()
}

#[cfg(not(feature = "enable_backtrace"))]
pub fn get_backtrace() -> impl std::fmt::Display {
    "Backtrace is not available."
}

fn setup_log_on_panic(logger: slog::Logger) {
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = get_backtrace();

        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &**s,
                None => "Unknown panic object",
            },
        };

        match info.location() {
            Some(location) => {
                error!(
                    logger,
                    "panic '{}': {}:{}\n{}",
                    msg,
                    location.file(),
                    location.line(),
                    backtrace
                );
            }
            None => {
                error!(logger, "panic '{}'\n{}", msg, backtrace);
            }
        }
    }));
}
