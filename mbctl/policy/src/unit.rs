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

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Latency critical, owns whole NUMA nodes.
    Socket,
    LowPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifeCyclePhase {
    Admitted,
    /// Nodes preempted, waiting for incubation to end.
    Reserved,
    Running,
    /// Pod gone; reaped on the next cycle.
    Terminating,
}

/// An allocation grain: the traffic of one control group on a set of NUMA
/// nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub task_type: TaskType,
    pub phase: LifeCyclePhase,
    pub nodes: BTreeSet<NodeId>,
    pub ctrl_group: QosGroup,
}

impl Unit {
    /// CCDs of the unit's nodes that belong to `domain`.
    pub fn ccds(&self, domain: &MbDomain) -> Vec<CcdId> {
        self.nodes
            .iter()
            .filter_map(|node| domain.node_ccds(*node))
            .flatten()
            .copied()
            .collect()
    }

    pub fn usage(&self, domain: &MbDomain, snapshot: &MbSnapshot) -> u64 {
        snapshot
            .get(&self.ctrl_group)
            .map_or(0, |g| g.sum_over(&self.ccds(domain)).total_mb)
    }
}

/// Units known from admission. A NUMA node belongs to at most one unit.
#[derive(Debug, Default)]
pub struct AppPool {
    units: BTreeMap<String, Unit>,
    node_owner: BTreeMap<NodeId, String>,
}

pub type SharedAppPool = Arc<Mutex<AppPool>>;

impl AppPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedAppPool {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Add an admitted unit. Adding the same unit on the same nodes again
    /// is a no-op. Terminating units give up their nodes to new ones.
    pub fn create_unit(
        &mut self,
        id: &str,
        task_type: TaskType,
        nodes: BTreeSet<NodeId>,
        ctrl_group: QosGroup,
    ) -> Result<()> {
        if nodes.is_empty() {
            bail!("Unit {} has no NUMA nodes", id);
        }
        if let Some(existing) = self.units.get(id) {
            if existing.phase != LifeCyclePhase::Terminating {
                if existing.nodes == nodes {
                    return Ok(());
                }
                bail!("Unit {} already exists on nodes {:?}", id, existing.nodes);
            }
            self.remove_unit(id);
        }
        let mut leaving = Vec::new();
        for node in &nodes {
            if let Some(owner) = self.node_owner.get(node) {
                match self.units.get(owner) {
                    Some(unit) if unit.phase == LifeCyclePhase::Terminating => {
                        leaving.push(owner.clone())
                    }
                    _ => bail!("NUMA node {} of unit {} is owned by unit {}", node, id, owner),
                }
            }
        }
        for owner in leaving {
            self.remove_unit(&owner);
        }
        for node in &nodes {
            self.node_owner.insert(*node, id.to_string());
        }
        self.units.insert(
            id.to_string(),
            Unit {
                id: id.to_string(),
                task_type,
                phase: LifeCyclePhase::Admitted,
                nodes,
                ctrl_group,
            },
        );
        Ok(())
    }

    pub fn remove_unit(&mut self, id: &str) -> Option<Unit> {
        let unit = self.units.remove(id)?;
        for node in &unit.nodes {
            self.node_owner.remove(node);
        }
        Some(unit)
    }

    pub fn set_phase(&mut self, id: &str, phase: LifeCyclePhase) -> Result<()> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown unit {}", id))?;
        unit.phase = phase;
        Ok(())
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn node_owner(&self, node: NodeId) -> Option<&str> {
        self.node_owner.get(&node).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Remove and return every Terminating unit.
    pub fn reap_terminated(&mut self) -> Vec<Unit> {
        let ids: Vec<String> = self
            .units
            .values()
            .filter(|u| u.phase == LifeCyclePhase::Terminating)
            .map(|u| u.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove_unit(id)).collect()
    }
}

/// The units sharing one domain.
#[derive(Debug)]
pub struct Package<'a> {
    pub domain: &'a MbDomain,
    pub preempting: BTreeSet<NodeId>,
    pub units: Vec<Unit>,
}

impl Package<'_> {
    pub fn is_preempting(&self) -> bool {
        !self.preempting.is_empty()
    }
}

/// Group units by domain. Pool units are cut down to their nodes in each
/// domain. Traffic on nodes no pool unit owns and no admission is
/// preempting becomes one derived low priority unit per control group.
pub fn build_packages<'a>(
    pool: &AppPool,
    domains: &'a DomainManager,
    snapshot: &MbSnapshot,
) -> Vec<Package<'a>> {
    let mut packages = Vec::new();
    for domain in domains.domains() {
        let preempting = domain.get_preempting_nodes();
        let mut owned = BTreeSet::new();
        let mut units = Vec::new();
        for unit in pool.units() {
            let nodes: BTreeSet<NodeId> = unit
                .nodes
                .iter()
                .filter(|n| domain.has_node(**n))
                .copied()
                .collect();
            if nodes.is_empty() {
                continue;
            }
            owned.extend(nodes.iter().copied());
            units.push(Unit {
                nodes,
                ..unit.clone()
            });
        }

        let free_nodes: BTreeSet<NodeId> = domain
            .numa_nodes()
            .iter()
            .filter(|n| !owned.contains(*n) && !preempting.contains(*n))
            .copied()
            .collect();
        if !free_nodes.is_empty() {
            for (group, mb_group) in snapshot {
                let derived = Unit {
                    id: format!("{}@{}", group, domain.id()),
                    task_type: TaskType::LowPriority,
                    phase: LifeCyclePhase::Running,
                    nodes: free_nodes.clone(),
                    ctrl_group: *group,
                };
                if derived
                    .ccds(domain)
                    .iter()
                    .any(|ccd| mb_group.ccd_mb.contains_key(ccd))
                {
                    units.push(derived);
                }
            }
        }

        packages.push(Package {
            domain,
            preempting,
            units,
        });
    }
    packages
}
