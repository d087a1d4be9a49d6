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

/// What a policy may be built from.
#[derive(Clone)]
pub struct PolicyDeps {
    pub logger: slog::Logger,
    pub params: PolicyParams,
    pub pool: SharedAppPool,
}

pub type PolicyConstructor = fn(PolicyDeps) -> Box<dyn MbPolicy>;

/// Maps a configured `PolicyKind` to its constructor. Built once at
/// startup.
pub struct PolicyRegistry {
    constructors: BTreeMap<PolicyKind, PolicyConstructor>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut registry = PolicyRegistry {
            constructors: BTreeMap::new(),
        };
        registry.register(PolicyKind::Domain, |deps| {
            Box::new(DomainPolicy::new(deps.logger, deps.params))
        });
        registry.register(PolicyKind::Unit, |deps| {
            Box::new(UnitPolicy::new(deps.logger, deps.params, deps.pool))
        });
        registry
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: PolicyKind, constructor: PolicyConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn build(&self, kind: PolicyKind, deps: PolicyDeps) -> Result<Box<dyn MbPolicy>> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| anyhow!("No policy registered for {}", kind))?;
        let logger = deps.logger.clone();
        let policy = constructor(deps);
        debug!(logger, "Built policy"; "kind" => kind.to_string(), "name" => policy.name());
        Ok(policy)
    }
}
