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

//! The control loop: snapshot, plan, deliver. It runs on its own thread on
//! a fixed tick, and out of cycle whenever admission asks for it.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::SyncSender;
use std::sync::mpsc::TrySendError;
use std::sync::mpsc::sync_channel;
use std::thread;

use super::*;
use crate::deliver::Deliverer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    /// Stopped on request or after a cycle panicked. Terminal.
    Stopped,
}

/// Asks the controller for an out-of-cycle run. Never blocks; requests
/// made while one is pending coalesce.
#[derive(Clone)]
pub struct AdjustTrigger {
    sender: SyncSender<()>,
}

impl AdjustTrigger {
    /// A trigger and the end the control loop waits on.
    pub fn channel() -> (Self, Receiver<()>) {
        let (sender, receiver) = sync_channel(1);
        (AdjustTrigger { sender }, receiver)
    }

    /// Returns false once the controller is gone.
    pub fn req_to_adjust_mb(&self) -> bool {
        match self.sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

pub struct Controller {
    logger: slog::Logger,
    domains: Arc<DomainManager>,
    monitor: Box<dyn Monitor>,
    policy: Box<dyn MbPolicy>,
    deliverer: Deliverer,
    interval: Duration,
}

impl Controller {
    pub fn new(
        logger: slog::Logger,
        domains: Arc<DomainManager>,
        monitor: Box<dyn Monitor>,
        policy: Box<dyn MbPolicy>,
        deliverer: Deliverer,
        interval: Duration,
    ) -> Self {
        Controller {
            logger,
            domains,
            monitor,
            policy,
            deliverer,
            interval,
        }
    }

    /// Compute this cycle's decision without delivering it.
    pub fn plan_once(&mut self, now: Instant) -> Result<(MbSnapshot, Option<MbDecision>)> {
        let snapshot = self
            .monitor
            .get_mb_qos_groups()
            .context("Failed to read bandwidth")?;
        let decision = self
            .policy
            .get_plan(&self.domains, &snapshot, now)
            .with_context(|| format!("Policy {} failed", self.policy.name()))?;
        Ok((snapshot, decision))
    }

    /// One full cycle. Returns the delivered decision, if any.
    pub fn run_once(&mut self, now: Instant) -> Result<Option<MbDecision>> {
        let (snapshot, decision) = self.plan_once(now)?;
        if let Some(decision) = &decision {
            let written = self
                .deliverer
                .deliver(decision, &snapshot, &self.domains)
                .context("Failed to deliver plan")?;
            debug!(self.logger, "Cycle done"; "written" => written);
        }
        Ok(decision)
    }

    /// Move the loop onto its own thread.
    pub fn start(self) -> Result<ControllerHandle> {
        let (trigger, receiver) = AdjustTrigger::channel();
        let state = Arc::new(Mutex::new(ControllerState::Idle));
        let stop = Arc::new(AtomicBool::new(false));
        let logger = self.logger.clone();

        let thread_state = state.clone();
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("mbctl_controller".to_owned())
            .spawn(move || {
                let mut controller = self;
                let set_state = |s| *thread_state.lock().unwrap_or_else(|e| e.into_inner()) = s;
                while !thread_stop.load(Ordering::Acquire) {
                    let cycle_start = Instant::now();
                    set_state(ControllerState::Running);
                    match catch_unwind(AssertUnwindSafe(|| controller.run_once(cycle_start))) {
                        Ok(Ok(Some(_))) => {}
                        Ok(Ok(None)) => debug!(controller.logger, "No bandwidth change"),
                        Ok(Err(e)) => error!(controller.logger, "{:#}", e),
                        Err(_) => {
                            error!(controller.logger, "Control cycle panicked, stopping");
                            break;
                        }
                    }
                    set_state(ControllerState::Idle);

                    let wait = (cycle_start + controller.interval)
                        .saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                set_state(ControllerState::Stopped);
            })
            .context("Failed to spawn controller thread")?;

        info!(logger, "Controller started");
        Ok(ControllerHandle {
            logger,
            trigger,
            state,
            stop,
            thread: Some(thread),
        })
    }
}

pub struct ControllerHandle {
    logger: slog::Logger,
    trigger: AdjustTrigger,
    state: Arc<Mutex<ControllerState>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn trigger(&self) -> AdjustTrigger {
        self.trigger.clone()
    }

    pub fn req_to_adjust_mb(&self) -> bool {
        self.trigger.req_to_adjust_mb()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Let the running cycle finish, start no new one and wait for the
    /// thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.trigger.req_to_adjust_mb();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(self.logger, "Controller thread panicked");
            }
            info!(self.logger, "Controller stopped");
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
