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

//! Kernel id lists such as `cpulist` or `has_cpu`: "0-3,8,10-11".

use std::collections::BTreeSet;

fn parse_id(s: &str) -> Result<usize, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("Invalid id \"{}\"", s))
}

/// Parse a comma separated list of ids and inclusive ranges. An empty or
/// blank string is an empty set.
pub fn parse_id_list(s: &str) -> Result<BTreeSet<usize>, String> {
    let mut ids = BTreeSet::new();
    let s = s.trim();
    if s.is_empty() {
        return Ok(ids);
    }
    for part in s.split(',') {
        match part.split_once('-') {
            Some((first, last)) => {
                let first = parse_id(first)?;
                let last = parse_id(last)?;
                if first > last {
                    return Err(format!("Invalid range \"{}\"", part));
                }
                ids.extend(first..=last);
            }
            None => {
                ids.insert(parse_id(part)?);
            }
        }
    }
    Ok(ids)
}

/// Inverse of `parse_id_list`, collapsing consecutive ids into ranges.
pub fn format_id_list(ids: &BTreeSet<usize>) -> String {
    let mut parts = Vec::new();
    let mut iter = ids.iter().copied();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    let mut push = |start: usize, end: usize| {
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    };
    for id in iter {
        if id == end + 1 {
            end = id;
            continue;
        }
        push(start, end);
        start = id;
        end = id;
    }
    push(start, end);
    parts.join(",")
}
