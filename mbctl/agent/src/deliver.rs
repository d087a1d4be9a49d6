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

/// Below this share of the bound, usage says too little about where the
/// traffic will go and the bound is split evenly instead.
const EVEN_SPLIT_USAGE_RATIO: f64 = 0.4;

/// Sink for per-CCD bandwidth limits.
pub trait MbSetter: Send {
    fn set_mb(&mut self, ctrl_group: &str, ccd: CcdId, mb: u64) -> Result<()>;

    /// Whether `ctrl_group` still holds `limits`, as last passed to
    /// `set_mb`. Setters that cannot read limits back trust their caller.
    fn in_force(&self, _ctrl_group: &str, _limits: &BTreeMap<CcdId, u64>) -> bool {
        true
    }
}

impl MbSetter for resctrlfs::ResctrlWriter {
    fn set_mb(&mut self, ctrl_group: &str, ccd: CcdId, mb: u64) -> Result<()> {
        resctrlfs::ResctrlWriter::set_mb(self, ctrl_group, ccd as u64, mb)
            .with_context(|| format!("Failed to set MB of {} on CCD {}", ctrl_group, ccd))?;
        Ok(())
    }

    /// Compares against the group's schemata. An unreadable schemata, e.g.
    /// of a removed group, counts as changed.
    fn in_force(&self, ctrl_group: &str, limits: &BTreeMap<CcdId, u64>) -> bool {
        match self.read_schemata(ctrl_group) {
            Ok(schemata) => limits.iter().all(|(ccd, mb)| {
                schemata.mb.get(&(*ccd as u64)) == Some(&self.schemata_value(*mb))
            }),
            Err(_) => false,
        }
    }
}

/// Logs limits instead of applying them.
pub struct DryRunSetter {
    logger: slog::Logger,
}

impl DryRunSetter {
    pub fn new(logger: slog::Logger) -> Self {
        DryRunSetter { logger }
    }
}

impl MbSetter for DryRunSetter {
    fn set_mb(&mut self, ctrl_group: &str, ccd: CcdId, mb: u64) -> Result<()> {
        info!(self.logger, "Dry run"; "group" => ctrl_group, "ccd" => ccd, "mb" => mb);
        Ok(())
    }
}

/// Split `total` over CCDs by their usage, or evenly when they use little
/// of it.
pub fn distribute_ccd_mbs(total: u64, ccd_usage: &BTreeMap<CcdId, u64>) -> BTreeMap<CcdId, u64> {
    if ccd_usage.is_empty() {
        return BTreeMap::new();
    }
    let used: u64 = ccd_usage.values().sum();
    if used as f64 <= EVEN_SPLIT_USAGE_RATIO * total as f64 {
        let even = total / ccd_usage.len() as u64;
        return ccd_usage.keys().map(|ccd| (*ccd, even)).collect();
    }
    ccd_usage
        .iter()
        .map(|(ccd, mb)| {
            let share = (*mb as f64 * total as f64 / used as f64).round() as u64;
            (*ccd, share)
        })
        .collect()
}

/// Turn node-level bounds into per-CCD limits: each bound is split evenly
/// over the unit's nodes, then over each node's CCDs by the group's usage.
pub fn allocs_to_plan(
    allocs: &[MbAlloc],
    snapshot: &MbSnapshot,
    domains: &DomainManager,
) -> Result<MbPlan> {
    let mut plan = MbPlan::new();
    for alloc in allocs {
        if alloc.nodes.is_empty() {
            continue;
        }
        let per_node = alloc.mb_upper_bound / alloc.nodes.len() as u64;
        let group = snapshot.get(&alloc.ctrl_group);
        for node in &alloc.nodes {
            let domain_id = domains
                .identify_domain_by_node(*node)
                .with_context(|| format!("Cannot place unit {}", alloc.unit_id))?;
            let ccds = domains
                .domain(domain_id)
                .and_then(|d| d.node_ccds(*node))
                .ok_or_else(|| anyhow!("NUMA node {} has no CCDs", node))?;
            let usage: BTreeMap<CcdId, u64> = ccds
                .iter()
                .map(|ccd| (*ccd, group.map_or(0, |g| g.ccd_total(*ccd))))
                .collect();
            plan.insert_group(alloc.ctrl_group, distribute_ccd_mbs(per_node, &usage));
        }
    }
    Ok(plan)
}

/// Applies decisions, skipping limits that are already in place. Cached
/// limits are checked against the setter before they are skipped, so a
/// schemata reset or a re-created group gets rewritten.
pub struct Deliverer {
    logger: slog::Logger,
    setter: Box<dyn MbSetter>,
    applied: BTreeMap<(QosGroup, CcdId), u64>,
}

impl Deliverer {
    pub fn new(logger: slog::Logger, setter: Box<dyn MbSetter>) -> Self {
        Deliverer {
            logger,
            setter,
            applied: BTreeMap::new(),
        }
    }

    /// Write every limit of `plan` that differs from the last one written.
    /// Stops at the first failure; limits written before it stay. Returns
    /// the number of limits written.
    pub fn deliver_plan(&mut self, plan: &MbPlan) -> Result<usize> {
        let mut written = 0;
        for (group, ccds) in plan.groups() {
            let ctrl_group = group.ctrl_group();
            let cached: BTreeMap<CcdId, u64> = ccds
                .iter()
                .filter(|(ccd, mb)| self.applied.get(&(*group, **ccd)) == Some(*mb))
                .map(|(ccd, mb)| (*ccd, *mb))
                .collect();
            if !cached.is_empty() && !self.setter.in_force(&ctrl_group, &cached) {
                info!(
                    self.logger,
                    "Limits changed outside mbctl, rewriting";
                    "group" => &ctrl_group,
                );
                self.applied.retain(|(g, _), _| g != group);
            }
            for (ccd, mb) in ccds {
                if self.applied.get(&(*group, *ccd)) == Some(mb) {
                    continue;
                }
                self.setter.set_mb(&ctrl_group, *ccd, *mb)?;
                self.applied.insert((*group, *ccd), *mb);
                written += 1;
            }
        }
        if written > 0 {
            debug!(self.logger, "Delivered plan"; "written" => written, "plan" => plan.to_string());
        }
        Ok(written)
    }

    pub fn deliver_mb_allocs(
        &mut self,
        allocs: &[MbAlloc],
        snapshot: &MbSnapshot,
        domains: &DomainManager,
    ) -> Result<usize> {
        let plan = allocs_to_plan(allocs, snapshot, domains)?;
        self.deliver_plan(&plan)
    }

    /// Deliver a whole decision. Explicit plan entries win over limits
    /// derived from node-level bounds.
    pub fn deliver(
        &mut self,
        decision: &MbDecision,
        snapshot: &MbSnapshot,
        domains: &DomainManager,
    ) -> Result<usize> {
        let derived = allocs_to_plan(&decision.allocs, snapshot, domains)?;
        self.deliver_plan(&decision.plan.clone().merge(&derived))
    }

    /// Forget what was written, so the next plan is written in full.
    pub fn reset(&mut self) {
        self.applied.clear();
    }
}
