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

//! Boundary to the node power-capping and eviction services. Both are
//! remote and optional: when the endpoint is down the agent keeps running
//! on empty answers and reconnects on the next call.

use std::fmt;
use std::str::FromStr;

use super::*;

pub const OP_CODE_KEY: &str = "op-code";
pub const CURRENT_KEY: &str = "current";
pub const TARGET_KEY: &str = "target";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CappingOp {
    Init,
    Reset,
    Cap,
}

impl FromStr for CappingOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init" => Ok(CappingOp::Init),
            "reset" => Ok(CappingOp::Reset),
            "cap" => Ok(CappingOp::Cap),
            _ => bail!("Unknown capping op-code: {}", s),
        }
    }
}

impl fmt::Display for CappingOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CappingOp::Init => write!(f, "init"),
            CappingOp::Reset => write!(f, "reset"),
            CappingOp::Cap => write!(f, "cap"),
        }
    }
}

/// A power-capping instruction. `current` and `target` are watts and only
/// meaningful for `Cap`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CappingInstruction {
    pub op: CappingOp,
    pub current_watt: u64,
    pub target_watt: u64,
}

impl CappingInstruction {
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let op: CappingOp = map
            .get(OP_CODE_KEY)
            .ok_or_else(|| anyhow!("Capping instruction without {}", OP_CODE_KEY))?
            .parse()?;
        let watt = |key: &str| -> Result<u64> {
            match map.get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid {} value: {}", key, v)),
                None if op == CappingOp::Cap => bail!("Cap instruction without {}", key),
                None => Ok(0),
            }
        };
        let instruction = CappingInstruction {
            op,
            current_watt: watt(CURRENT_KEY)?,
            target_watt: watt(TARGET_KEY)?,
        };
        if op == CappingOp::Cap && instruction.target_watt >= instruction.current_watt {
            bail!(
                "Cap target {} is not below current {}",
                instruction.target_watt,
                instruction.current_watt
            );
        }
        Ok(instruction)
    }
}

pub trait Capper: Send {
    fn init(&mut self) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
    fn cap(&mut self, target_watt: u64, current_watt: u64) -> Result<()>;
}

pub fn dispatch(capper: &mut dyn Capper, instruction: &CappingInstruction) -> Result<()> {
    match instruction.op {
        CappingOp::Init => capper.init(),
        CappingOp::Reset => capper.reset(),
        CappingOp::Cap => capper.cap(instruction.target_watt, instruction.current_watt),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictPod {
    pub pod_uid: String,
    pub pod_name: String,
    pub reason: String,
}

pub trait EvictPlugin: Send {
    fn get_evict_pods(&mut self) -> Result<Vec<EvictPod>>;
}

/// Wraps a connection to a remote service. Connects on first use, drops
/// the connection when a call fails and connects again on the next call.
/// Failures never reach the caller.
pub struct ReconnectingClient<C, F>
where
    F: FnMut() -> Result<C>,
{
    logger: slog::Logger,
    name: &'static str,
    connect: F,
    conn: Option<C>,
}

impl<C, F> ReconnectingClient<C, F>
where
    F: FnMut() -> Result<C>,
{
    pub fn new(logger: slog::Logger, name: &'static str, connect: F) -> Self {
        ReconnectingClient {
            logger,
            name,
            connect,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Run `call` on the connection. On any failure the default value is
    /// returned and the connection is dropped.
    pub fn call_or_default<T, G>(&mut self, call: G) -> T
    where
        T: Default,
        G: FnOnce(&mut C) -> Result<T>,
    {
        if self.conn.is_none() {
            match (self.connect)() {
                Ok(conn) => {
                    info!(self.logger, "Connected"; "service" => self.name);
                    self.conn = Some(conn);
                }
                Err(e) => {
                    warn!(self.logger, "Failed to connect: {:#}", e; "service" => self.name);
                    return T::default();
                }
            }
        }
        let result = match self.conn.as_mut() {
            Some(conn) => call(conn),
            None => return T::default(),
        };
        match result {
            Ok(v) => v,
            Err(e) => {
                warn!(self.logger, "Call failed, reconnecting later: {:#}", e; "service" => self.name);
                self.conn = None;
                T::default()
            }
        }
    }
}

impl<C, F> Capper for ReconnectingClient<C, F>
where
    C: Capper,
    F: FnMut() -> Result<C> + Send,
{
    fn init(&mut self) -> Result<()> {
        self.call_or_default(|c| c.init());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.call_or_default(|c| c.reset());
        Ok(())
    }

    fn cap(&mut self, target_watt: u64, current_watt: u64) -> Result<()> {
        self.call_or_default(|c| c.cap(target_watt, current_watt));
        Ok(())
    }
}

impl<C, F> EvictPlugin for ReconnectingClient<C, F>
where
    C: EvictPlugin,
    F: FnMut() -> Result<C> + Send,
{
    fn get_evict_pods(&mut self) -> Result<Vec<EvictPod>> {
        Ok(self.call_or_default(|c| c.get_evict_pods()))
    }
}
