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

use std::fs;
use std::path::Path;

use super::*;

fn read_sysfs_value(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .trim()
        .to_string())
}

/// Static layout of packages, NUMA nodes and CCDs.
///
/// Every CCD belongs to exactly one NUMA node and every NUMA node to exactly
/// one package. Both are checked on construction so that lookups afterwards
/// can only fail for ids that are not part of the machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DieTopology {
    numas_in_package: BTreeMap<DomainId, Vec<NodeId>>,
    dies_in_numa: BTreeMap<NodeId, BTreeSet<CcdId>>,
    ccd_node: BTreeMap<CcdId, NodeId>,
    node_package: BTreeMap<NodeId, DomainId>,
}

impl DieTopology {
    pub fn new(
        numas_in_package: BTreeMap<DomainId, Vec<NodeId>>,
        dies_in_numa: BTreeMap<NodeId, BTreeSet<CcdId>>,
    ) -> Result<Self> {
        if numas_in_package.is_empty() {
            bail!("Topology has no packages");
        }

        let mut node_package = BTreeMap::new();
        for (package, nodes) in &numas_in_package {
            if nodes.is_empty() {
                bail!("Package {} has no NUMA nodes", package);
            }
            for node in nodes {
                if let Some(other) = node_package.insert(*node, *package) {
                    bail!(
                        "NUMA node {} belongs to both package {} and {}",
                        node,
                        other,
                        package
                    );
                }
            }
        }

        let mut ccd_node = BTreeMap::new();
        for (node, ccds) in &dies_in_numa {
            if !node_package.contains_key(node) {
                bail!("NUMA node {} is not in any package", node);
            }
            for ccd in ccds {
                if let Some(other) = ccd_node.insert(*ccd, *node) {
                    bail!(
                        "CCD {} belongs to both NUMA node {} and {}",
                        ccd,
                        other,
                        node
                    );
                }
            }
        }
        if let Some(node) = node_package.keys().find(|n| !dies_in_numa.contains_key(n)) {
            bail!("NUMA node {} has no CCDs", node);
        }

        Ok(DieTopology {
            numas_in_package,
            dies_in_numa,
            ccd_node,
            node_package,
        })
    }

    /// Discover the layout under a sysfs mount. NUMA nodes come from
    /// `devices/system/node`, a node's package from its CPUs'
    /// `physical_package_id`, and its CCDs from their L3 cache ids.
    /// Memory-only nodes are left out.
    pub fn from_sysfs(sys: &Path) -> Result<Self> {
        let node_dir = sys.join("devices/system/node");
        let cpu_dir = sys.join("devices/system/cpu");
        let mut numas_in_package: BTreeMap<DomainId, Vec<NodeId>> = BTreeMap::new();
        let mut dies_in_numa = BTreeMap::new();

        let entries = fs::read_dir(&node_dir)
            .with_context(|| format!("Failed to read {}", node_dir.display()))?;
        let mut nodes = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read {}", node_dir.display()))?;
            let name = entry.file_name();
            if let Some(node) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<NodeId>().ok())
            {
                nodes.insert(node);
            }
        }

        for node in nodes {
            let cpulist = read_sysfs_value(&node_dir.join(format!("node{}/cpulist", node)))?;
            let cpus = common::idlist::parse_id_list(&cpulist)
                .map_err(|e| anyhow!("Bad cpulist of NUMA node {}: {}", node, e))?;
            let Some(first) = cpus.first() else {
                continue;
            };
            let package: DomainId = read_sysfs_value(
                &cpu_dir.join(format!("cpu{}/topology/physical_package_id", first)),
            )?
            .parse()
            .with_context(|| format!("Bad package id of cpu {}", first))?;
            let mut ccds = BTreeSet::new();
            for cpu in &cpus {
                let l3: CcdId = read_sysfs_value(&cpu_dir.join(format!("cpu{}/cache/index3/id", cpu)))?
                    .parse()
                    .with_context(|| format!("Bad L3 id of cpu {}", cpu))?;
                ccds.insert(l3);
            }
            numas_in_package.entry(package).or_default().push(node);
            dies_in_numa.insert(node, ccds);
        }
        Self::new(numas_in_package, dies_in_numa)
    }

    pub fn packages(&self) -> usize {
        self.numas_in_package.len()
    }

    pub fn package_ids(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.numas_in_package.keys().copied()
    }

    pub fn numas_in_package(&self, package: DomainId) -> Option<&[NodeId]> {
        self.numas_in_package.get(&package).map(|v| v.as_slice())
    }

    pub fn dies_in_numa(&self, node: NodeId) -> Option<&BTreeSet<CcdId>> {
        self.dies_in_numa.get(&node)
    }

    pub fn ccd_node(&self, ccd: CcdId) -> Option<NodeId> {
        self.ccd_node.get(&ccd).copied()
    }

    pub fn node_package(&self, node: NodeId) -> Option<DomainId> {
        self.node_package.get(&node).copied()
    }

    pub fn all_ccds(&self) -> impl Iterator<Item = CcdId> + '_ {
        self.ccd_node.keys().copied()
    }
}
