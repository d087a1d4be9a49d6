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

//! Pod admission hook. Classifies pods from their annotations, and for
//! Socket pods (dedicated and NUMA exclusive) preempts the hinted NUMA
//! nodes before the pod starts.

use policy::AppPool;
use policy::LifeCyclePhase;
use policy::SharedAppPool;
use policy::TaskType;

use super::*;
use crate::controller::AdjustTrigger;

pub const QOS_LEVEL_ANNOTATION: &str = "mbctl.io/qos-level";
pub const NUMA_BINDING_ANNOTATION: &str = "mbctl.io/numa-binding";
pub const NUMA_EXCLUSIVE_ANNOTATION: &str = "mbctl.io/numa-exclusive";
pub const SHARED_PRIORITY_ANNOTATION: &str = "mbctl.io/shared-priority";
pub const CLOSID_ANNOTATION: &str = "mbctl.io/closid";
pub const NEED_MON_GROUPS_ANNOTATION: &str = "mbctl.io/need-mon-groups";

pub const DEFAULT_SHARED_PRIORITY: u32 = 50;

/// How admission sees a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodClass {
    pub group: QosGroup,
    pub numa_binding: bool,
    pub numa_exclusive: bool,
}

impl PodClass {
    /// Dedicated, NUMA bound and NUMA exclusive.
    pub fn is_socket(&self) -> bool {
        self.group == QosGroup::Dedicated && self.numa_binding && self.numa_exclusive
    }

    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        let flag = |key: &str| annotations.get(key).is_some_and(|v| v == "true");
        let level = annotations
            .get(QOS_LEVEL_ANNOTATION)
            .map_or("shared", String::as_str);
        let group = match level {
            "dedicated" => QosGroup::Dedicated,
            "system" => QosGroup::System,
            "reclaimed" => QosGroup::Reclaimed,
            "shared" => {
                let priority = match annotations.get(SHARED_PRIORITY_ANNOTATION) {
                    Some(p) => p
                        .parse()
                        .with_context(|| format!("Invalid shared priority \"{}\"", p))?,
                    None => DEFAULT_SHARED_PRIORITY,
                };
                format!("shared-{}", priority).parse()?
            }
            other => bail!("Unknown QoS level \"{}\"", other),
        };
        Ok(PodClass {
            group,
            numa_binding: flag(NUMA_BINDING_ANNOTATION),
            numa_exclusive: flag(NUMA_EXCLUSIVE_ANNOTATION),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub pod_uid: String,
    pub pod_name: String,
    pub annotations: BTreeMap<String, String>,
    /// NUMA nodes the topology manager picked for the pod.
    pub hint_nodes: BTreeSet<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResponse {
    /// resctrl control group the pod's tasks go into.
    pub closid: String,
    pub need_mon_groups: bool,
}

impl AllocationResponse {
    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLOSID_ANNOTATION.to_string(), self.closid.clone()),
            (
                NEED_MON_GROUPS_ANNOTATION.to_string(),
                self.need_mon_groups.to_string(),
            ),
        ])
    }
}

pub struct PodAdmitter {
    logger: slog::Logger,
    domains: Arc<DomainManager>,
    pool: SharedAppPool,
    trigger: AdjustTrigger,
}

impl PodAdmitter {
    pub fn new(
        logger: slog::Logger,
        domains: Arc<DomainManager>,
        pool: SharedAppPool,
        trigger: AdjustTrigger,
    ) -> Self {
        PodAdmitter {
            logger,
            domains,
            pool,
            trigger,
        }
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, AppPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate(&self, req: &AllocationRequest) -> Result<AllocationResponse> {
        let class = PodClass::from_annotations(&req.annotations)
            .with_context(|| format!("Cannot classify pod {}", req.pod_name))?;
        let response = AllocationResponse {
            closid: class.group.ctrl_group(),
            need_mon_groups: class.is_socket(),
        };
        if !class.is_socket() {
            return Ok(response);
        }

        if req.hint_nodes.is_empty() {
            bail!("Socket pod {} has no NUMA hint", req.pod_name);
        }
        for node in &req.hint_nodes {
            self.domains
                .identify_domain_by_node(*node)
                .with_context(|| format!("Bad NUMA hint for pod {}", req.pod_name))?;
        }
        let nodes: Vec<NodeId> = req.hint_nodes.iter().copied().collect();
        let preempted = {
            let mut pool = self.pool();
            pool.create_unit(
                &req.pod_uid,
                TaskType::Socket,
                req.hint_nodes.clone(),
                QosGroup::Dedicated,
            )?;
            let preempted = match self.domains.preempt_nodes(&nodes) {
                Ok(preempted) => preempted,
                Err(e) => {
                    pool.remove_unit(&req.pod_uid);
                    return Err(e);
                }
            };
            pool.set_phase(&req.pod_uid, LifeCyclePhase::Reserved)?;
            preempted
        };

        info!(
            self.logger,
            "Admitted socket pod";
            "pod" => &req.pod_name,
            "nodes" => format!("{:?}", nodes),
            "preempted" => preempted,
        );
        if preempted && !self.trigger.req_to_adjust_mb() {
            warn!(self.logger, "Controller is gone, bandwidth not adjusted");
        }
        Ok(response)
    }

    /// Release what `allocate` took for a pod. The unit stays in the pool
    /// as Terminating until the next cycle reaps it, but its nodes are no
    /// longer preempted. Returns false for pods that own nothing.
    pub fn remove_pod(&self, pod_uid: &str) -> Result<bool> {
        let nodes: Vec<NodeId> = {
            let mut pool = self.pool();
            let Some(unit) = pool.unit(pod_uid) else {
                return Ok(false);
            };
            let nodes = unit.nodes.iter().copied().collect();
            pool.set_phase(pod_uid, LifeCyclePhase::Terminating)?;
            nodes
        };
        self.domains.unpreempt_nodes(&nodes)?;
        info!(self.logger, "Removed socket pod"; "pod" => pod_uid);
        self.trigger.req_to_adjust_mb();
        Ok(true)
    }
}
