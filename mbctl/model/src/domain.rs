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

use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use super::*;

#[derive(Default, Debug)]
struct DomainState {
    preempting_nodes: BTreeSet<NodeId>,
    incubated_ccds: BTreeMap<CcdId, Instant>,
}

/// The NUMA nodes and CCDs of one package, plus the preemption and
/// incubation state admission keeps for them.
#[derive(Debug)]
pub struct MbDomain {
    id: DomainId,
    numa_nodes: Vec<NodeId>,
    ccd_node: BTreeMap<CcdId, NodeId>,
    node_ccds: BTreeMap<NodeId, Vec<CcdId>>,
    ccds: Vec<CcdId>,
    incubation_interval: Duration,
    state: RwLock<DomainState>,
}

impl MbDomain {
    fn new(id: DomainId, topology: &DieTopology, incubation_interval: Duration) -> Result<Self> {
        let numa_nodes = topology
            .numas_in_package(id)
            .ok_or_else(|| anyhow!("Package {} not in topology", id))?
            .to_vec();
        let mut ccd_node = BTreeMap::new();
        let mut node_ccds = BTreeMap::new();
        for node in &numa_nodes {
            let ccds = topology
                .dies_in_numa(*node)
                .ok_or_else(|| anyhow!("NUMA node {} has no CCDs", node))?;
            for ccd in ccds {
                ccd_node.insert(*ccd, *node);
            }
            node_ccds.insert(*node, ccds.iter().copied().collect());
        }
        let ccds = ccd_node.keys().copied().collect();
        Ok(MbDomain {
            id,
            numa_nodes,
            ccd_node,
            node_ccds,
            ccds,
            incubation_interval,
            state: RwLock::new(DomainState::default()),
        })
    }

    // The state is plain sets and maps that are never left half updated, so
    // a panic elsewhere while holding the lock does not invalidate it.
    fn read(&self) -> RwLockReadGuard<'_, DomainState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DomainState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn numa_nodes(&self) -> &[NodeId] {
        &self.numa_nodes
    }

    /// Sorted CCDs of the domain.
    pub fn ccds(&self) -> &[CcdId] {
        &self.ccds
    }

    pub fn has_ccd(&self, ccd: CcdId) -> bool {
        self.ccd_node.contains_key(&ccd)
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.node_ccds.contains_key(&node)
    }

    pub fn ccd_node(&self, ccd: CcdId) -> Option<NodeId> {
        self.ccd_node.get(&ccd).copied()
    }

    pub fn node_ccds(&self, node: NodeId) -> Option<&[CcdId]> {
        self.node_ccds.get(&node).map(|v| v.as_slice())
    }

    pub fn incubation_interval(&self) -> Duration {
        self.incubation_interval
    }

    /// Reserve `nodes` for an admitting pod. Nodes outside this domain are
    /// ignored. Returns true if any node was not reserved before; the CCDs
    /// of those nodes start incubating.
    pub fn preempt_nodes(&self, nodes: &[NodeId]) -> bool {
        self.preempt_nodes_at(nodes, Instant::now())
    }

    pub fn preempt_nodes_at(&self, nodes: &[NodeId], now: Instant) -> bool {
        let mut newly = Vec::new();
        {
            let mut state = self.write();
            for node in nodes.iter().filter(|n| self.has_node(**n)) {
                if state.preempting_nodes.insert(*node) {
                    newly.push(*node);
                }
            }
            let expiry = now + self.incubation_interval;
            for node in &newly {
                for ccd in self.node_ccds(*node).unwrap_or_default() {
                    state.incubated_ccds.insert(*ccd, expiry);
                }
            }
        }
        !newly.is_empty()
    }

    pub fn unpreempt_nodes(&self, nodes: &[NodeId]) {
        let mut state = self.write();
        for node in nodes {
            state.preempting_nodes.remove(node);
        }
    }

    /// Start (or restart) the grace window of exactly the given CCDs.
    pub fn start_incubation(&self, ccds: &[CcdId]) {
        self.start_incubation_at(ccds, Instant::now())
    }

    pub fn start_incubation_at(&self, ccds: &[CcdId], now: Instant) {
        let expiry = now + self.incubation_interval;
        let mut state = self.write();
        for ccd in ccds.iter().filter(|c| self.has_ccd(**c)) {
            state.incubated_ccds.insert(*ccd, expiry);
        }
    }

    /// Drop incubation entries whose window has passed.
    pub fn cleanse_incubates(&self) {
        self.cleanse_incubates_at(Instant::now())
    }

    pub fn cleanse_incubates_at(&self, now: Instant) {
        self.write().incubated_ccds.retain(|_, expiry| *expiry > now);
    }

    pub fn get_preempting_nodes(&self) -> BTreeSet<NodeId> {
        self.read().preempting_nodes.clone()
    }

    pub fn is_preempting(&self) -> bool {
        !self.read().preempting_nodes.is_empty()
    }

    pub fn clone_incubates(&self) -> BTreeMap<CcdId, Instant> {
        self.read().incubated_ccds.clone()
    }
}

/// Owns one `MbDomain` per package. Built once at startup and shared by
/// the controller and admission through an `Arc`.
#[derive(Debug)]
pub struct DomainManager {
    domains: BTreeMap<DomainId, MbDomain>,
    ccd_domain: BTreeMap<CcdId, DomainId>,
    node_domain: BTreeMap<NodeId, DomainId>,
}

impl DomainManager {
    pub fn new(topology: &DieTopology, incubation_interval: Duration) -> Result<Self> {
        let mut domains = BTreeMap::new();
        let mut ccd_domain = BTreeMap::new();
        let mut node_domain = BTreeMap::new();
        for id in topology.package_ids() {
            let domain = MbDomain::new(id, topology, incubation_interval)?;
            for ccd in domain.ccds() {
                ccd_domain.insert(*ccd, id);
            }
            for node in domain.numa_nodes() {
                node_domain.insert(*node, id);
            }
            domains.insert(id, domain);
        }
        Ok(DomainManager {
            domains,
            ccd_domain,
            node_domain,
        })
    }

    pub fn domains(&self) -> impl Iterator<Item = &MbDomain> {
        self.domains.values()
    }

    pub fn domain(&self, id: DomainId) -> Option<&MbDomain> {
        self.domains.get(&id)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Domain owning `ccd`. An unmapped CCD means the topology and the
    /// monitored data disagree, which is reported instead of guessed.
    pub fn identify_domain_by_ccd(&self, ccd: CcdId) -> Result<DomainId> {
        self.ccd_domain
            .get(&ccd)
            .copied()
            .ok_or_else(|| anyhow!("CCD {} does not belong to any domain", ccd))
    }

    pub fn identify_domain_by_node(&self, node: NodeId) -> Result<DomainId> {
        self.node_domain
            .get(&node)
            .copied()
            .ok_or_else(|| anyhow!("NUMA node {} does not belong to any domain", node))
    }

    /// Reserve `nodes` in their domains. Returns true if any node was newly
    /// reserved. Unknown nodes fail the call before any state changes.
    pub fn preempt_nodes(&self, nodes: &[NodeId]) -> Result<bool> {
        self.preempt_nodes_at(nodes, Instant::now())
    }

    pub fn preempt_nodes_at(&self, nodes: &[NodeId], now: Instant) -> Result<bool> {
        let by_domain = self.group_nodes(nodes)?;
        let mut changed = false;
        for (id, nodes) in by_domain {
            if let Some(domain) = self.domains.get(&id) {
                changed |= domain.preempt_nodes_at(&nodes, now);
            }
        }
        Ok(changed)
    }

    pub fn unpreempt_nodes(&self, nodes: &[NodeId]) -> Result<()> {
        for (id, nodes) in self.group_nodes(nodes)? {
            if let Some(domain) = self.domains.get(&id) {
                domain.unpreempt_nodes(&nodes);
            }
        }
        Ok(())
    }

    pub fn cleanse_incubates(&self) {
        self.cleanse_incubates_at(Instant::now())
    }

    pub fn cleanse_incubates_at(&self, now: Instant) {
        for domain in self.domains.values() {
            domain.cleanse_incubates_at(now);
        }
    }

    fn group_nodes(&self, nodes: &[NodeId]) -> Result<BTreeMap<DomainId, Vec<NodeId>>> {
        let mut by_domain: BTreeMap<DomainId, Vec<NodeId>> = BTreeMap::new();
        for node in nodes {
            by_domain
                .entry(self.identify_domain_by_node(*node)?)
                .or_default()
                .push(*node);
        }
        Ok(by_domain)
    }
}
