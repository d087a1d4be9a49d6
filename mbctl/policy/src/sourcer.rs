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

//! Cross-domain quota sourcing.
//!
//! Leaf traffic issued on one domain's CCDs may be served by the other
//! domain's memory. A domain's target therefore bounds a mix of both
//! domains' leaf traffic:
//!
//! ```text
//!   ratio_0 * q_0 + (1 - ratio_1) * q_1 <= target_0     (domain 0)
//!   (1 - ratio_0) * q_0 + ratio_1 * q_1 <= target_1     (domain 1)
//! ```
//!
//! where `ratio_i` is the share of domain i's leaf traffic that stays
//! local and `q_i` is the quota granted to traffic sourced from domain i.
//! Each constrained domain is a line in the `(q_0, q_1)` plane, and the
//! feasible quotas lie below all of them and above the `min_value` floor
//! on both axes, unless a domain already uses less than that:
//!
//! ```text
//!    q_1
//!     |\
//!     | \  domain 0
//!     |  \       P (current usage)
//!     |   x<----*
//!     |    \
//!  min|.....\...........
//!     |      \
//!     +-------------------- q_0
//! ```
//!
//! The geometric sourcer picks the feasible candidate closest to the
//! current usage `P`, so the quotas move as little as possible. Candidates
//! are the projection of `P` on each line, the points where each line
//! meets the floor, and the crossing of both lines.

use super::*;

/// Quota value meaning "not bounded by any domain".
pub const NO_CONSTRAINT: i64 = -1;

const EPSILON: f64 = 1e-9;

/// Leaf traffic of one domain and the target it must stay under.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DomainMbTargetSource {
    /// MBps the domain may absorb; `NO_CONSTRAINT` if unlimited.
    pub target: i64,
    /// Leaf traffic issued on the domain's CCDs.
    pub mb_source: u64,
    /// Part of `mb_source` served by another domain's memory.
    pub mb_source_remote: u64,
}

impl DomainMbTargetSource {
    pub fn local_ratio(&self) -> f64 {
        if self.mb_source == 0 {
            return 1.0;
        }
        if self.mb_source_remote >= self.mb_source {
            return 0.0;
        }
        1.0 - self.mb_source_remote as f64 / self.mb_source as f64
    }

    fn is_constrained(&self) -> bool {
        self.target >= 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

impl Point {
    fn coord(&self, axis: usize) -> f64 {
        if axis == 0 { self.x } else { self.y }
    }

    fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// `a * x + b * y = c`
#[derive(Clone, Copy, Debug, PartialEq)]
struct Line {
    a: f64,
    b: f64,
    c: f64,
}

impl Line {
    /// The constraint a domain's target puts on both quotas, if any.
    fn constraint(host: usize, sources: &[DomainMbTargetSource; 2]) -> Option<Line> {
        if !sources[host].is_constrained() {
            return None;
        }
        let own = sources[host].local_ratio();
        let landing = 1.0 - sources[1 - host].local_ratio();
        let (a, b) = if host == 0 { (own, landing) } else { (landing, own) };
        // Nothing lands in this domain, so its target bounds nothing.
        if a <= EPSILON && b <= EPSILON {
            return None;
        }
        Some(Line {
            a,
            b,
            c: sources[host].target as f64,
        })
    }

    fn coef(&self, axis: usize) -> f64 {
        if axis == 0 { self.a } else { self.b }
    }

    fn value(&self, p: &Point) -> f64 {
        self.a * p.x + self.b * p.y
    }

    fn tolerance(&self) -> f64 {
        1e-6 * self.c.abs().max(1.0)
    }

    fn admits(&self, p: &Point) -> bool {
        self.value(p) <= self.c + self.tolerance()
    }

    fn is_binding(&self, p: &Point) -> bool {
        (self.value(p) - self.c).abs() <= self.tolerance()
    }

    fn project(&self, p: &Point) -> Point {
        let d = (self.value(p) - self.c) / (self.a * self.a + self.b * self.b);
        Point {
            x: p.x - d * self.a,
            y: p.y - d * self.b,
        }
    }

    fn at_x(&self, x: f64) -> Option<Point> {
        if self.b.abs() <= EPSILON {
            return None;
        }
        Some(Point {
            x,
            y: (self.c - self.a * x) / self.b,
        })
    }

    fn at_y(&self, y: f64) -> Option<Point> {
        if self.a.abs() <= EPSILON {
            return None;
        }
        Some(Point {
            x: (self.c - self.b * y) / self.a,
            y,
        })
    }

    fn cross(&self, other: &Line) -> Option<Point> {
        let det = self.a * other.b - other.a * self.b;
        if det.abs() <= EPSILON {
            return None;
        }
        Some(Point {
            x: (self.c * other.b - other.c * self.b) / det,
            y: (self.a * other.c - other.a * self.c) / det,
        })
    }
}

/// Strategy turning per-domain targets into per-domain leaf quotas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sourcer {
    /// Least disruptive feasible point in quota space.
    Geometric { min_value: u64 },
    /// Scale every source by its tightest domain's overshoot.
    Proportional { min_value: u64 },
}

impl Sourcer {
    pub fn new(kind: SourcerKind, min_value: u64) -> Self {
        match kind {
            SourcerKind::Geometric => Sourcer::Geometric { min_value },
            SourcerKind::Proportional => Sourcer::Proportional { min_value },
        }
    }

    /// Quotas for leaf traffic sourced from each of the two domains, by
    /// position. `NO_CONSTRAINT` marks a quota nothing bounds.
    pub fn attribute_mb_to_sources(&self, sources: &[DomainMbTargetSource; 2]) -> [i64; 2] {
        let lines = [Line::constraint(0, sources), Line::constraint(1, sources)];
        if lines.iter().all(Option::is_none) {
            return [NO_CONSTRAINT; 2];
        }
        let current = Point {
            x: sources[0].mb_source as f64,
            y: sources[1].mb_source as f64,
        };
        match self {
            Sourcer::Geometric { min_value } => geometric(&lines, &current, *min_value as f64),
            Sourcer::Proportional { min_value } => {
                proportional(&lines, &current, *min_value as f64)
            }
        }
    }
}

fn geometric(lines: &[Option<Line>; 2], current: &Point, min_value: f64) -> [i64; 2] {
    // The floor never asks a domain for more than it already uses.
    let floor_x = min_value.min(current.x);
    let floor_y = min_value.min(current.y);
    let mut candidates = Vec::new();
    for line in lines.iter().flatten() {
        candidates.push(line.project(current));
        candidates.extend(line.at_x(floor_x));
        candidates.extend(line.at_y(floor_y));
    }
    if let [Some(l0), Some(l1)] = lines {
        candidates.extend(l0.cross(l1));
    }

    let slack = |floor: f64| floor - 1e-6 * floor.max(1.0);
    let best = candidates
        .into_iter()
        .filter(|p| p.x >= slack(floor_x) && p.y >= slack(floor_y))
        .filter(|p| lines.iter().flatten().all(|l| l.admits(p)))
        .min_by(|a, b| {
            a.distance(current)
                .partial_cmp(&b.distance(current))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    match best {
        Some(best) => relax(lines, &best),
        None => [NO_CONSTRAINT; 2],
    }
}

/// Raise every coordinate no binding constraint pins to the largest value
/// the constraints allow.
fn relax(lines: &[Option<Line>; 2], p: &Point) -> [i64; 2] {
    let mut quotas = [NO_CONSTRAINT; 2];
    for (axis, quota) in quotas.iter_mut().enumerate() {
        let bounding: Vec<&Line> = lines
            .iter()
            .flatten()
            .filter(|l| l.coef(axis) > EPSILON)
            .collect();
        if bounding.iter().any(|l| l.is_binding(p)) {
            *quota = p.coord(axis).round() as i64;
            continue;
        }
        let other = p.coord(1 - axis);
        let limit = bounding
            .iter()
            .map(|l| (l.c - l.coef(1 - axis) * other) / l.coef(axis))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
        if let Some(limit) = limit {
            *quota = limit.max(p.coord(axis)).round() as i64;
        }
    }
    quotas
}

fn proportional(lines: &[Option<Line>; 2], current: &Point, min_value: f64) -> [i64; 2] {
    let mut quotas = [NO_CONSTRAINT; 2];
    for (axis, quota) in quotas.iter_mut().enumerate() {
        let scaled = lines
            .iter()
            .flatten()
            .filter(|l| l.coef(axis) > EPSILON)
            .map(|l| {
                let consumption = l.value(current);
                if consumption <= EPSILON {
                    f64::INFINITY
                } else {
                    l.c / consumption * current.coord(axis)
                }
            })
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
        if let Some(scaled) = scaled.filter(|v| v.is_finite()) {
            *quota = scaled.max(min_value.min(current.coord(axis))).round() as i64;
        }
    }
    quotas
}
