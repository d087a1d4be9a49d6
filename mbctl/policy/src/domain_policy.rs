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

//! Two-level domain policy.
//!
//! Every QoS group but the lowest one present (the leaf) runs unlimited at
//! `ccd_max`. The leaf lives in what is left of each domain:
//!
//! 1. Each domain's target for leaf traffic is its capacity minus the
//!    higher groups' traffic landing in it and the incubation reservation.
//! 2. With two domains, the sourcer turns the targets into quotas for the
//!    leaf traffic issued on each domain, accounting for traffic that
//!    crosses between them.
//! 3. Each domain's adjuster moves the leaf's per-CCD limits towards its
//!    quota, or leaves them alone.

use super::*;

/// One domain's share of a snapshot.
#[derive(Debug, Default)]
struct DomainUsage {
    /// Higher group traffic served by this domain's memory.
    landing_mb: f64,
    /// Higher group traffic issued on this domain's CCDs.
    higher_mb: u64,
    leaf_ccd_mbs: BTreeMap<CcdId, u64>,
    leaf_mb: u64,
    leaf_remote_mb: u64,
    reservation_mb: u64,
}

pub struct DomainPolicy {
    logger: slog::Logger,
    params: PolicyParams,
    planner: CcdGroupPlanner,
    sourcer: Sourcer,
}

impl DomainPolicy {
    pub fn new(logger: slog::Logger, params: PolicyParams) -> Self {
        DomainPolicy {
            logger,
            planner: params.planner(),
            sourcer: Sourcer::new(params.sourcer, params.min_domain_quota_mb),
            params,
        }
    }

    fn collect_usage(
        &self,
        domains: &DomainManager,
        snapshot: &MbSnapshot,
        leaf: QosGroup,
        now: Instant,
    ) -> Result<BTreeMap<DomainId, DomainUsage>> {
        let mut usage: BTreeMap<DomainId, DomainUsage> = domains
            .domains()
            .map(|d| (d.id(), DomainUsage::default()))
            .collect();
        let peers = domains.len().saturating_sub(1);

        for (group, mb_group) in snapshot {
            for (ccd, data) in &mb_group.ccd_mb {
                let id = domains
                    .identify_domain_by_ccd(*ccd)
                    .with_context(|| format!("Cannot place {} traffic", group))?;
                if *group == leaf {
                    let entry = usage.entry(id).or_default();
                    entry.leaf_ccd_mbs.insert(*ccd, data.total_mb);
                    entry.leaf_mb += data.total_mb;
                    entry.leaf_remote_mb += data.remote_mb;
                    continue;
                }
                let entry = usage.entry(id).or_default();
                entry.higher_mb += data.total_mb;
                entry.landing_mb += data.local_mb as f64;
                if peers > 0 {
                    let spread = data.remote_mb as f64 / peers as f64;
                    for (other, entry) in usage.iter_mut() {
                        if *other != id {
                            entry.landing_mb += spread;
                        }
                    }
                }
            }
        }

        for domain in domains.domains() {
            let incubated = live_incubates(domain, now);
            if let Some(entry) = usage.get_mut(&domain.id()) {
                entry.reservation_mb = incubation_reservation(
                    &incubated,
                    snapshot,
                    self.params.incubation_floor_per_ccd_mb,
                );
            }
        }
        Ok(usage)
    }

    fn target(&self, usage: &DomainUsage) -> i64 {
        let protected = usage.landing_mb + usage.reservation_mb as f64;
        (self.params.domain_capacity_mb as f64 - protected)
            .max(0.0)
            .round() as i64
    }

    fn leaf_quotas(&self, usage: &BTreeMap<DomainId, DomainUsage>) -> BTreeMap<DomainId, i64> {
        let targets: Vec<(DomainId, DomainMbTargetSource)> = usage
            .iter()
            .map(|(id, u)| {
                let source = DomainMbTargetSource {
                    target: self.target(u),
                    mb_source: u.leaf_mb,
                    mb_source_remote: u.leaf_remote_mb,
                };
                (*id, source)
            })
            .collect();
        match targets.as_slice() {
            [(id0, s0), (id1, s1)] => {
                let quotas = self.sourcer.attribute_mb_to_sources(&[*s0, *s1]);
                [(*id0, quotas[0]), (*id1, quotas[1])].into_iter().collect()
            }
            _ => targets.iter().map(|(id, s)| (*id, s.target)).collect(),
        }
    }
}

impl MbPolicy for DomainPolicy {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn get_plan(
        &mut self,
        domains: &DomainManager,
        snapshot: &MbSnapshot,
        now: Instant,
    ) -> Result<Option<MbDecision>> {
        let leaf = match leaf_group(snapshot) {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        let usage = self.collect_usage(domains, snapshot, leaf, now)?;
        let quotas = self.leaf_quotas(&usage);

        let mut higher = MbPlan::new();
        for (group, mb_group) in snapshot.range((
            std::ops::Bound::Excluded(leaf),
            std::ops::Bound::Unbounded,
        )) {
            higher.insert_group(
                *group,
                self.planner
                    .get_fixed_plan(self.planner.max(), &mb_group.ccds),
            );
        }

        let thresholds = self.params.thresholds();
        let mut parts = vec![Some(higher)];
        for (id, u) in &usage {
            let quota = quotas.get(id).copied().unwrap_or(NO_CONSTRAINT);
            let capacity = if quota >= 0 {
                quota as u64
            } else {
                self.params
                    .domain_capacity_mb
                    .saturating_sub(u.higher_mb + u.reservation_mb)
            };
            let adjuster =
                DomainMbAdjuster::select(capacity, &u.leaf_ccd_mbs, &self.planner, &thresholds);
            let ccd_plan = adjuster.and_then(|a| {
                a.get_plan(
                    capacity,
                    &u.leaf_ccd_mbs,
                    &self.planner,
                    self.params.ease_threshold_mb,
                )
            });
            debug!(
                self.logger,
                "Domain leaf adjustment";
                "domain" => *id,
                "group" => leaf.to_string(),
                "quota" => quota,
                "capacity" => capacity,
                "usage" => u.leaf_mb,
                "reservation" => u.reservation_mb,
                "adjuster" => adjuster.map_or_else(|| "none".to_string(), |a| a.to_string()),
            );
            parts.push(ccd_plan.map(|p| MbPlan::from_group(leaf, p)));
        }

        Ok(MbPlan::merge_partials(parts)
            .filter(|plan| !plan.is_empty())
            .map(|plan| MbDecision {
                plan,
                allocs: Vec::new(),
            }))
    }
}
