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
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

pub mod domain;
pub mod mb;
pub mod monitor;
pub mod qos;
pub mod rate;
pub mod topology;


pub use domain::*;
pub use mb::*;
pub use monitor::*;
pub use qos::*;
pub use rate::*;
pub use topology::*;

/// CCD (L3 die) id as exposed by resctrl `mon_L3_XX` directories.
pub type CcdId = usize;
/// NUMA node id.
pub type NodeId = usize;
/// Package id, which is also the id of its bandwidth domain.
pub type DomainId = usize;
