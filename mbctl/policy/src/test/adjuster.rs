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

fn planner() -> CcdGroupPlanner {
    CcdGroupPlanner::new(1000, 20000)
}

fn thresholds(ease_mode: EaseMode) -> AdjustThresholds {
    AdjustThresholds {
        ease_threshold_mb: 4000,
        throttle_threshold_mb: 2000,
        ease_mode,
    }
}

#[test]
fn test_proportional_plan_clamps() {
    let plan = planner().get_proportional_plan(2.0, &btreemap! {0 => 300, 1 => 6000, 2 => 15000});
    assert_eq!(plan, btreemap! {0 => 1000, 1 => 12000, 2 => 20000});
}

#[test]
fn test_distribute() {
    let p = planner();
    assert_eq!(
        p.distribute(9000, &btreemap! {0 => 0, 1 => 0, 2 => 0}),
        btreemap! {0 => 3000, 1 => 3000, 2 => 3000}
    );
    assert_eq!(
        p.distribute(9000, &btreemap! {0 => 1000, 1 => 2000}),
        btreemap! {0 => 3000, 1 => 6000}
    );
    assert_eq!(
        p.get_fixed_plan(20000, &[4, 5]),
        btreemap! {4 => 20000, 5 => 20000}
    );
}

#[test]
fn test_planner_min_above_max() {
    let p = CcdGroupPlanner::new(5000, 2000);
    assert_eq!(p.min(), 2000);
    assert_eq!(p.clamp(f64::NAN), 2000);
}

#[test]
fn test_select() {
    let p = planner();
    let usage = btreemap! {0 => 5000, 1 => 4000};
    let half = thresholds(EaseMode::Half);
    let select = |capacity| DomainMbAdjuster::select(capacity, &usage, &p, &half);

    assert_eq!(select(2000), Some(DomainMbAdjuster::ExtremeThrottle));
    assert_eq!(select(10000), Some(DomainMbAdjuster::HalfThrottle));
    // Free 3000: between the thresholds.
    assert_eq!(select(12000), None);
    assert_eq!(select(13000), Some(DomainMbAdjuster::HalfEase));
    assert_eq!(
        DomainMbAdjuster::select(13000, &usage, &p, &thresholds(EaseMode::Full)),
        Some(DomainMbAdjuster::FullEase)
    );
    assert_eq!(DomainMbAdjuster::select(13000, &BTreeMap::new(), &p, &half), None);
}

#[test]
fn test_throttle_plans() {
    let p = planner();
    let usage = btreemap! {0 => 5000, 1 => 4000};
    assert_eq!(
        DomainMbAdjuster::ExtremeThrottle.get_plan(2000, &usage, &p, 4000),
        Some(btreemap! {0 => 1000, 1 => 1000})
    );
    // min(9000 / 2, 10000 - 4000)
    assert_eq!(
        DomainMbAdjuster::HalfThrottle.get_plan(10000, &usage, &p, 4000),
        Some(btreemap! {0 => 2500, 1 => 2000})
    );
    // Capacity inside the ease headroom leaves nothing to distribute.
    assert_eq!(
        DomainMbAdjuster::HalfThrottle.get_plan(3000, &usage, &p, 4000),
        Some(btreemap! {0 => 1000, 1 => 1000})
    );
}

#[test]
fn test_ease_plans() {
    let p = planner();
    let usage = btreemap! {0 => 5000, 1 => 4000};
    // Full target 20000 - 4000 = 16000
    assert_eq!(
        DomainMbAdjuster::FullEase.get_plan(20000, &usage, &p, 4000),
        Some(btreemap! {0 => 8889, 1 => 7111})
    );
    // Midpoint of 9000 and 16000
    assert_eq!(
        DomainMbAdjuster::HalfEase.get_plan(20000, &usage, &p, 4000),
        Some(btreemap! {0 => 6944, 1 => 5556})
    );
    assert_eq!(DomainMbAdjuster::FullEase.get_plan(4000, &usage, &p, 4000), None);
    assert_eq!(DomainMbAdjuster::HalfEase.get_plan(3000, &usage, &p, 4000), None);
}
