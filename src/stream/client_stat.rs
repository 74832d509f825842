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

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const RECYCLE_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StatKey {
    src: String,
    dst: String,
    req_type: &'static str,
}

struct StatEntry {
    start: SystemTime,
    last_update: SystemTime,
    client_id: String,
    requests: u64,
    bytes_read: u64,
    topics: Vec<String>,
    topic_set: HashSet<String>,
    eof: bool,
    eof_time: Option<SystemTime>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatSnapshot {
    #[serde(rename = "Src")]
    pub src: String,
    #[serde(rename = "Dst")]
    pub dst: String,
    #[serde(rename = "ReqType")]
    pub req_type: &'static str,
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "LastUpdate")]
    pub last_update: DateTime<Utc>,
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "Requests")]
    pub requests: u64,
    #[serde(rename = "BytesRead")]
    pub bytes_read: u64,
    #[serde(rename = "Topics")]
    pub topics: Vec<String>,
    #[serde(rename = "Eof")]
    pub eof: bool,
    #[serde(rename = "EofTime")]
    pub eof_time: Option<DateTime<Utc>>,
}

/// Live table of (src, dst, request type) activity. Entries survive a
/// half-connection's end for a grace period so the last state stays
/// queryable, then the recycler removes them.
#[derive(Default)]
pub struct ClientStat {
    map: Mutex<HashMap<StatKey, StatEntry>>,
}

impl ClientStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one decoded request. Returns true when this is the first
    /// request of its type on the half-connection.
    pub fn observe(
        &self,
        src: &str,
        dst: &str,
        client_id: &str,
        req_type: &'static str,
        topics: &[String],
        bytes: usize,
    ) -> bool {
        let now = SystemTime::now();
        let key = StatKey {
            src: src.to_owned(),
            dst: dst.to_owned(),
            req_type,
        };
        let mut map = self.map.lock().unwrap();
        let len_before = map.len();
        let entry = map.entry(key).or_insert_with(|| StatEntry {
            start: now,
            last_update: now,
            client_id: String::new(),
            requests: 0,
            bytes_read: 0,
            topics: Vec::new(),
            topic_set: HashSet::new(),
            eof: false,
            eof_time: None,
        });
        entry.requests += 1;
        entry.bytes_read += bytes as u64;
        entry.client_id = client_id.to_owned();
        entry.last_update = now;
        for topic in topics {
            if entry.topic_set.insert(topic.clone()) {
                entry.topics.push(topic.clone());
            }
        }
        map.len() > len_before
    }

    /// Flags every entry of the half-connection as ended.
    pub fn mark_eof(&self, src: &str, dst: &str) {
        let now = SystemTime::now();
        let mut map = self.map.lock().unwrap();
        for (key, entry) in map.iter_mut() {
            if key.src == src && key.dst == dst {
                entry.eof = true;
                entry.eof_time = Some(now);
            }
        }
    }

    /// Removes entries whose half-connection ended more than `grace` ago.
    pub fn sweep(&self, grace: Duration) {
        let now = SystemTime::now();
        let mut map = self.map.lock().unwrap();
        map.retain(|_, entry| match entry.eof_time {
            Some(t) if entry.eof => now.duration_since(t).unwrap_or_default() <= grace,
            _ => true,
        });
    }

    /// Consistent copy of all entries, ordered by (src, dst, type, client id).
    pub fn snapshot(&self) -> Vec<StatSnapshot> {
        let mut out: Vec<StatSnapshot> = {
            let map = self.map.lock().unwrap();
            map.iter()
                .map(|(key, entry)| StatSnapshot {
                    src: key.src.clone(),
                    dst: key.dst.clone(),
                    req_type: key.req_type,
                    start: entry.start.into(),
                    last_update: entry.last_update.into(),
                    client_id: entry.client_id.clone(),
                    requests: entry.requests,
                    bytes_read: entry.bytes_read,
                    topics: entry.topics.clone(),
                    eof: entry.eof,
                    eof_time: entry.eof_time.map(Into::into),
                })
                .collect()
        };
        out.sort_by(|a, b| {
            (&a.src, &a.dst, a.req_type, &a.client_id)
                .cmp(&(&b.src, &b.dst, b.req_type, &b.client_id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn observe_creates_then_updates() {
        let stat = ClientStat::new();
        assert!(stat.observe("c:1", "b:9092", "app", "Produce", &topics(&["t"]), 64));
        assert!(!stat.observe("c:1", "b:9092", "app", "Produce", &topics(&["t"]), 36));
        assert!(stat.observe("c:1", "b:9092", "app", "Fetch", &[], 20));

        let snap = stat.snapshot();
        assert_eq!(snap.len(), 2);
        // sorted by request type within the same endpoints
        assert_eq!(snap[0].req_type, "Fetch");
        assert_eq!(snap[1].req_type, "Produce");
        assert_eq!(snap[1].requests, 2);
        assert_eq!(snap[1].bytes_read, 100);
        assert_eq!(snap[1].topics, vec!["t"]);
    }

    #[test]
    fn topic_membership_is_idempotent() {
        let stat = ClientStat::new();
        stat.observe("c", "b", "app", "Produce", &topics(&["b", "a"]), 1);
        stat.observe("c", "b", "app", "Produce", &topics(&["b", "a"]), 1);
        stat.observe("c", "b", "app", "Produce", &topics(&["c", "a"]), 1);
        let snap = stat.snapshot();
        assert_eq!(snap[0].topics, vec!["b", "a", "c"]);
    }

    #[test]
    fn mark_eof_and_sweep() {
        let stat = ClientStat::new();
        stat.observe("c:1", "b:9092", "app", "Produce", &[], 1);
        stat.observe("c:2", "b:9092", "app", "Produce", &[], 1);
        stat.mark_eof("c:1", "b:9092");

        let snap = stat.snapshot();
        assert!(snap.iter().any(|s| s.src == "c:1" && s.eof));
        assert!(snap.iter().any(|s| s.src == "c:2" && !s.eof));

        // within grace nothing is removed
        stat.sweep(Duration::from_secs(60));
        assert_eq!(stat.snapshot().len(), 2);

        // zero grace removes the ended entry only
        stat.sweep(Duration::ZERO);
        let snap = stat.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].src, "c:2");

        // sweeping again changes nothing
        stat.sweep(Duration::ZERO);
        assert_eq!(stat.snapshot().len(), 1);
    }

    #[test]
    fn observe_after_eof_keeps_entry_alive_state() {
        let stat = ClientStat::new();
        stat.observe("c", "b", "app", "Fetch", &[], 1);
        stat.mark_eof("c", "b");
        let snap = stat.snapshot();
        assert!(snap[0].eof);
        assert!(snap[0].eof_time.is_some());
    }

    #[test]
    fn concurrent_observe_and_eof_stay_consistent() {
        use std::sync::Arc;
        use std::thread;

        let stat = Arc::new(ClientStat::new());
        let writer = {
            let stat = stat.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    stat.observe("c", "b", "app", "Produce", &topics(&["t"]), 10);
                }
            })
        };
        let closer = {
            let stat = stat.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    stat.mark_eof("c", "b");
                }
            })
        };
        writer.join().unwrap();
        closer.join().unwrap();

        let snap = stat.snapshot();
        assert_eq!(snap.len(), 1);
        // the entry is never half-updated
        assert_eq!(snap[0].requests, 1000);
        assert_eq!(snap[0].bytes_read, 10_000);
        assert_eq!(snap[0].topics, vec!["t"]);
        assert_eq!(snap[0].eof, snap[0].eof_time.is_some());
    }

    #[test]
    fn snapshot_sort_order() {
        let stat = ClientStat::new();
        stat.observe("b", "x", "app", "Produce", &[], 1);
        stat.observe("a", "y", "app", "Produce", &[], 1);
        stat.observe("a", "x", "app", "Fetch", &[], 1);
        let snap = stat.snapshot();
        let keys: Vec<(String, String, &str)> = snap
            .iter()
            .map(|s| (s.src.clone(), s.dst.clone(), s.req_type))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".into(), "x".into(), "Fetch"),
                ("a".into(), "y".into(), "Produce"),
                ("b".into(), "x".into(), "Produce"),
            ]
        );
    }
}
