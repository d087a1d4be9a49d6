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

/// Workload priority class, mapped 1:1 to a resctrl control group.
///
/// Variants are declared from lowest to highest priority so the derived
/// ordering is the priority ordering: `reclaimed < shared-N < system <
/// dedicated`, with shared groups ordered by N.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum QosGroup {
    Reclaimed,
    Shared(u32),
    System,
    Dedicated,
}

pub const MAX_SHARED_PRIORITY: u32 = 100;

impl QosGroup {
    /// Name of the resctrl control group directory.
    pub fn ctrl_group(&self) -> String {
        self.to_string()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, QosGroup::Shared(_))
    }
}

impl fmt::Display for QosGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosGroup::Reclaimed => write!(f, "reclaimed"),
            QosGroup::Shared(p) => write!(f, "shared-{}", p),
            QosGroup::System => write!(f, "system"),
            QosGroup::Dedicated => write!(f, "dedicated"),
        }
    }
}

impl FromStr for QosGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reclaimed" => Ok(QosGroup::Reclaimed),
            "system" => Ok(QosGroup::System),
            "dedicated" => Ok(QosGroup::Dedicated),
            _ => {
                let priority = s
                    .strip_prefix("shared-")
                    .ok_or_else(|| anyhow!("Unknown QoS group: {}", s))?
                    .parse::<u32>()
                    .with_context(|| format!("Invalid shared group priority: {}", s))?;
                if priority > MAX_SHARED_PRIORITY {
                    bail!(
                        "Shared group priority {} exceeds {}",
                        priority,
                        MAX_SHARED_PRIORITY
                    );
                }
                Ok(QosGroup::Shared(priority))
            }
        }
    }
}

impl TryFrom<String> for QosGroup {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<QosGroup> for String {
    fn from(g: QosGroup) -> String {
        g.to_string()
    }
}
