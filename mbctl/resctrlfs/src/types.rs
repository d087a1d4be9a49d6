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
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Internal representation of the value read from monitoring data. This is a
/// wrapper around u64 that is used to handle the "Unavailable" state that can
/// be returned by resctrlfs.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RmidBytes {
    Bytes(u64),
    Unavailable,
}

impl RmidBytes {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            RmidBytes::Bytes(v) => Some(*v),
            RmidBytes::Unavailable => None,
        }
    }
}

/// Memory bandwidth counters of a single L3 domain (one CCD) within a group.
/// There is one of these per `mon_L3_XX` directory in `mon_data`.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct L3MonStat {
    pub mbm_total_bytes: Option<RmidBytes>,
    pub mbm_local_bytes: Option<RmidBytes>,
}

/// The `MB:` line of a group's schemata file, keyed by L3 domain id.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Schemata {
    pub mb: BTreeMap<u64, u64>,
}

/// Information about a MON group nested in a CTRL_MON group.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MonGroupStat {
    pub inode_number: Option<u64>,
    pub l3_mon_stat: Option<BTreeMap<u64, L3MonStat>>,
}

/// Information about a CTRL_MON group. See
/// https://www.kernel.org/doc/html/v6.4/arch/x86/resctrl.html
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CtrlMonGroupStat {
    pub inode_number: Option<u64>,
    pub l3_mon_stat: Option<BTreeMap<u64, L3MonStat>>,
    pub schemata: Option<Schemata>,
    pub mon_groups: Option<BTreeMap<String, MonGroupStat>>,
}

/// Monitoring state of the whole hierarchy. The root group is keyed by the
/// empty string.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ResctrlSample {
    pub ctrl_mon_groups: BTreeMap<String, CtrlMonGroupStat>,
}
