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

use common::util::bytes_to_mbps;

use super::*;

macro_rules! count_per_sec {
    ($a_opt:expr, $b_opt:expr, $delta:expr) => {{
        let mut ret = None;
        if let (Some(a), Some(b)) = ($a_opt, $b_opt) {
            if a <= b {
                ret = Some(bytes_to_mbps(b - a, $delta.as_secs_f64()));
            }
        }
        ret
    }};
}

/// A cumulative byte counter reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterSample {
    pub bytes: u64,
    pub at: Instant,
}

/// MBps between two readings of the same counter. `None` when `curr` is not
/// strictly newer than `prev`, the counter went backwards (wrap or group
/// re-creation), or the readings are more than `staleness` apart.
pub fn rate_mbps(prev: &CounterSample, curr: &CounterSample, staleness: Duration) -> Option<u64> {
    if curr.at <= prev.at {
        return None;
    }
    let delta = curr.at - prev.at;
    if delta > staleness {
        return None;
    }
    count_per_sec!(Some(prev.bytes), Some(curr.bytes), delta)
}

/// Remembers the last reading of every counter and turns each new reading
/// into a rate.
pub struct RateTracker<K> {
    staleness: Duration,
    last: BTreeMap<K, CounterSample>,
}

impl<K: Ord> RateTracker<K> {
    pub fn new(staleness: Duration) -> Self {
        RateTracker {
            staleness,
            last: BTreeMap::new(),
        }
    }

    /// Record `sample` for `key` and return the rate since the previous
    /// reading, if that rate is valid.
    pub fn update(&mut self, key: K, sample: CounterSample) -> Option<u64> {
        match self.last.get(&key) {
            Some(prev) if sample.at < prev.at => None,
            Some(prev) => {
                let rate = rate_mbps(prev, &sample, self.staleness);
                self.last.insert(key, sample);
                rate
            }
            None => {
                self.last.insert(key, sample);
                None
            }
        }
    }

    /// Forget counters that no longer exist.
    pub fn retain<F: FnMut(&K) -> bool>(&mut self, mut f: F) {
        self.last.retain(|k, _| f(k));
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
