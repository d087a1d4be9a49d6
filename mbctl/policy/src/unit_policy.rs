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

//! Node grain policy over AppPool units.
//!
//! A package with preempting nodes runs in preempt mode: the admitting pods
//! get a hard reservation and everyone else shares what remains, with the
//! lower classes cut first when it shrinks. Otherwise the package runs in
//! soft mode, where Socket units only face a generous per-node cap.

use super::*;

fn cut_weight(group: QosGroup) -> u64 {
    match group {
        QosGroup::Reclaimed => defaults::RECLAIMED_WEIGHT,
        QosGroup::Shared(_) => defaults::SHARED_WEIGHT,
        QosGroup::System | QosGroup::Dedicated => defaults::SYSTEM_WEIGHT,
    }
}

/// Part of `amount` owed to one of `count` consumers using `usage` out of
/// `total`. Even split when nobody uses anything.
fn share(amount: u64, usage: u64, total: u64, count: usize) -> u64 {
    if total == 0 {
        amount / count.max(1) as u64
    } else {
        (amount as f64 * usage as f64 / total as f64).round() as u64
    }
}

struct UnitUsage<'a> {
    unit: &'a Unit,
    usage: u64,
    ccd_count: usize,
}

impl UnitUsage<'_> {
    fn is_socket(&self) -> bool {
        self.unit.task_type == TaskType::Socket
    }
}

pub struct UnitPolicy {
    logger: slog::Logger,
    params: PolicyParams,
    pool: SharedAppPool,
}

impl UnitPolicy {
    pub fn new(logger: slog::Logger, params: PolicyParams, pool: SharedAppPool) -> Self {
        UnitPolicy {
            logger,
            params,
            pool,
        }
    }

    /// Reap terminated units and let Reserved units whose CCDs finished
    /// incubating run normally.
    fn advance_lifecycle(
        &self,
        pool: &mut AppPool,
        domains: &DomainManager,
        incubating: &BTreeSet<CcdId>,
    ) -> Result<()> {
        for unit in pool.reap_terminated() {
            info!(self.logger, "Reaped unit"; "unit" => &unit.id);
            let preempted: Vec<NodeId> = unit.nodes.iter().copied().collect();
            domains.unpreempt_nodes(&preempted)?;
        }

        let ready: Vec<(String, Vec<NodeId>)> = pool
            .units()
            .filter(|u| u.task_type == TaskType::Socket && u.phase == LifeCyclePhase::Reserved)
            .filter(|u| {
                domains
                    .domains()
                    .flat_map(|d| u.ccds(d))
                    .all(|ccd| !incubating.contains(&ccd))
            })
            .map(|u| (u.id.clone(), u.nodes.iter().copied().collect()))
            .collect();
        for (id, nodes) in ready {
            pool.set_phase(&id, LifeCyclePhase::Running)?;
            domains.unpreempt_nodes(&nodes)?;
            info!(self.logger, "Unit finished incubation"; "unit" => &id);
        }
        Ok(())
    }

    fn floor(&self, ccd_count: usize) -> u64 {
        self.params.ccd_min_mb * ccd_count as u64
    }

    fn alloc(&self, u: &UnitUsage, bound: u64) -> MbAlloc {
        MbAlloc {
            unit_id: u.unit.id.clone(),
            ctrl_group: u.unit.ctrl_group,
            nodes: u.unit.nodes.clone(),
            mb_upper_bound: bound.max(self.floor(u.ccd_count)),
        }
    }

    /// Pro-rata lounge share of each Socket unit, by unit index.
    fn lounge_shares(&self, units: &[UnitUsage]) -> BTreeMap<usize, u64> {
        let sockets: Vec<(usize, &UnitUsage)> =
            units.iter().enumerate().filter(|(_, u)| u.is_socket()).collect();
        let total: u64 = sockets.iter().map(|(_, u)| u.usage).sum();
        sockets
            .iter()
            .map(|(i, u)| {
                (
                    *i,
                    share(self.params.socket_lounge_mb, u.usage, total, sockets.len()),
                )
            })
            .collect()
    }

    fn preempt_mode(
        &self,
        package: &Package,
        snapshot: &MbSnapshot,
        incubating: &BTreeSet<CcdId>,
        plan: &mut MbPlan,
        allocs: &mut Vec<MbAlloc>,
    ) {
        let domain = package.domain;
        let reserved_per_numa = self.params.reserved_per_numa_mb;
        let mut reserved_ccds = BTreeSet::new();
        for node in &package.preempting {
            let ccds = domain.node_ccds(*node).unwrap_or(&[]);
            if ccds.is_empty() {
                continue;
            }
            let per_ccd = reserved_per_numa / ccds.len() as u64;
            for ccd in ccds {
                plan.insert(QosGroup::Dedicated, *ccd, per_ccd);
                reserved_ccds.insert(*ccd);
            }
        }

        // Preempting nodes are already covered by their reservation.
        let incubated = incubating
            .iter()
            .filter(|ccd| domain.has_ccd(**ccd) && !reserved_ccds.contains(*ccd));
        let reservation =
            incubation_reservation(incubated, snapshot, self.params.incubation_floor_per_ccd_mb);
        let capacity = self.params.domain_capacity_mb.saturating_sub(reservation);
        let reserved = reserved_per_numa * package.preempting.len() as u64;
        let free = capacity.saturating_sub(reserved + self.params.socket_lounge_mb);

        let units: Vec<UnitUsage> = package
            .units
            .iter()
            .filter(|u| !u.nodes.is_subset(&package.preempting))
            .map(|unit| UnitUsage {
                unit,
                usage: unit.usage(domain, snapshot),
                ccd_count: unit.ccds(domain).len(),
            })
            .collect();
        let total: u64 = units.iter().map(|u| u.usage).sum();
        let lounge = self.lounge_shares(&units);

        let weighted: f64 = units
            .iter()
            .filter(|u| !u.is_socket())
            .map(|u| u.usage as f64 / cut_weight(u.unit.ctrl_group) as f64)
            .sum();
        let deficit = total.saturating_sub(free);

        debug!(
            self.logger,
            "Preempt mode";
            "domain" => domain.id(),
            "preempting" => package.preempting.len(),
            "capacity" => capacity,
            "free" => free,
            "usage" => total,
        );

        for (i, u) in units.iter().enumerate() {
            let base = if deficit == 0 {
                share(free, u.usage, total, units.len())
            } else if u.is_socket() || weighted <= 0.0 {
                u.usage
            } else {
                let cut = deficit as f64 * (u.usage as f64 / cut_weight(u.unit.ctrl_group) as f64)
                    / weighted;
                u.usage.saturating_sub(cut.round() as u64)
            };
            let bound = base + lounge.get(&i).copied().unwrap_or(0);
            allocs.push(self.alloc(u, bound));
        }
    }

    fn soft_mode(
        &self,
        package: &Package,
        snapshot: &MbSnapshot,
        incubating: &BTreeSet<CcdId>,
        allocs: &mut Vec<MbAlloc>,
    ) {
        let domain = package.domain;
        let incubated = incubating.iter().filter(|ccd| domain.has_ccd(**ccd));
        let reservation =
            incubation_reservation(incubated, snapshot, self.params.incubation_floor_per_ccd_mb);
        let capacity = self.params.domain_capacity_mb.saturating_sub(reservation);

        let units: Vec<UnitUsage> = package
            .units
            .iter()
            .map(|unit| UnitUsage {
                unit,
                usage: unit.usage(domain, snapshot),
                ccd_count: unit.ccds(domain).len(),
            })
            .collect();
        let lounge = self.lounge_shares(&units);
        let socket_usage: u64 = units.iter().filter(|u| u.is_socket()).map(|u| u.usage).sum();
        let low: Vec<&UnitUsage> = units.iter().filter(|u| !u.is_socket()).collect();
        let low_usage: u64 = low.iter().map(|u| u.usage).sum();
        let allocatable = capacity.saturating_sub(self.params.socket_lounge_mb + socket_usage);

        debug!(
            self.logger,
            "Soft mode";
            "domain" => domain.id(),
            "capacity" => capacity,
            "socket_usage" => socket_usage,
            "allocatable" => allocatable,
        );

        for (i, u) in units.iter().enumerate() {
            let bound = if u.is_socket() {
                self.params.socket_node_max_mb * u.unit.nodes.len() as u64
                    + lounge.get(&i).copied().unwrap_or(0)
            } else {
                share(allocatable, u.usage, low_usage, low.len())
            };
            allocs.push(self.alloc(u, bound));
        }
    }
}

impl MbPolicy for UnitPolicy {
    fn name(&self) -> &'static str {
        "unit"
    }

    fn get_plan(
        &mut self,
        domains: &DomainManager,
        snapshot: &MbSnapshot,
        now: Instant,
    ) -> Result<Option<MbDecision>> {
        let incubating: BTreeSet<CcdId> = domains
            .domains()
            .flat_map(|d| live_incubates(d, now))
            .collect();

        let packages = {
            let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
            self.advance_lifecycle(&mut pool, domains, &incubating)?;
            build_packages(&pool, domains, snapshot)
        };

        let mut decision = MbDecision::default();
        for package in &packages {
            if package.is_preempting() {
                self.preempt_mode(
                    package,
                    snapshot,
                    &incubating,
                    &mut decision.plan,
                    &mut decision.allocs,
                );
            } else {
                self.soft_mode(package, snapshot, &incubating, &mut decision.allocs);
            }
        }
        if decision.is_empty() {
            return Ok(None);
        }
        Ok(Some(decision))
    }
}
