/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const FLOW_SWEEP_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize)]
pub struct Flow {
    #[serde(rename = "Src")]
    pub src: String,
    #[serde(rename = "Dst")]
    pub dst: String,
    #[serde(rename = "PayloadSum")]
    pub payload_sum: u64,
    #[serde(rename = "Closed")]
    pub closed: bool,
    #[serde(rename = "Update")]
    pub update: DateTime<Utc>,
}

struct FlowEntry {
    src: String,
    dst: String,
    payload_sum: u64,
    closed: bool,
    update: SystemTime,
}

/// Raw per-direction byte accounting over all captured TCP packets, without
/// reassembly. Closed flows (FIN or RST seen) are swept after a grace period.
#[derive(Default)]
pub struct FlowTable {
    map: Mutex<HashMap<String, FlowEntry>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, src: &str, dst: &str, payload_len: usize, closed: bool) {
        let mut map = self.map.lock().unwrap();
        let entry = map
            .entry(format!("{}->{}", src, dst))
            .or_insert_with(|| FlowEntry {
                src: src.to_owned(),
                dst: dst.to_owned(),
                payload_sum: 0,
                closed: false,
                update: SystemTime::now(),
            });
        entry.payload_sum += payload_len as u64;
        entry.closed |= closed;
        entry.update = SystemTime::now();
    }

    pub fn sweep(&self, grace: Duration) {
        let now = SystemTime::now();
        let mut map = self.map.lock().unwrap();
        map.retain(|_, entry| {
            !(entry.closed && now.duration_since(entry.update).unwrap_or_default() >= grace)
        });
    }

    pub fn snapshot(&self) -> Vec<Flow> {
        let map = self.map.lock().unwrap();
        map.values()
            .map(|e| Flow {
                src: e.src.clone(),
                dst: e.dst.clone(),
                payload_sum: e.payload_sum,
                closed: e.closed,
                update: e.update.into(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_payload_bytes() {
        let table = FlowTable::new();
        table.update("10.0.0.1:5000", "10.0.0.2:9092", 100, false);
        table.update("10.0.0.1:5000", "10.0.0.2:9092", 50, false);
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].payload_sum, 150);
        assert!(!snap[0].closed);
    }

    #[test]
    fn close_is_sticky() {
        let table = FlowTable::new();
        table.update("a", "b", 10, true);
        table.update("a", "b", 10, false);
        assert!(table.snapshot()[0].closed);
    }

    #[test]
    fn sweep_removes_closed_after_grace() {
        let table = FlowTable::new();
        table.update("a", "b", 1, true);
        table.update("c", "d", 1, false);

        table.sweep(Duration::from_secs(60));
        assert_eq!(table.snapshot().len(), 2);

        table.sweep(Duration::ZERO);
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].src, "c");
    }

    #[test]
    fn directions_are_distinct_flows() {
        let table = FlowTable::new();
        table.update("a", "b", 1, false);
        table.update("b", "a", 2, false);
        assert_eq!(table.snapshot().len(), 2);
    }
}
