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
use std::time::{Duration, Instant};

use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
};

const NAMESPACE: &str = "kafkaprobe";

pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(5 * 60);
/// How often the relation sweeper wakes up to drop expired label tuples.
pub const EXPIRE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Labelled gauge whose samples are forgotten when their label tuple has not
/// been updated for `expire_time`. Only fresh producer/consumer relations
/// stay visible on the exposition endpoint.
struct ExpiringGaugeVec {
    gauge: GaugeVec,
    expire_time: Duration,
    relations: Mutex<HashMap<String, Relation>>,
}

struct Relation {
    labels: Vec<String>,
    deadline: Instant,
}

impl ExpiringGaugeVec {
    fn new(gauge: GaugeVec, expire_time: Duration) -> Self {
        Self {
            gauge,
            expire_time,
            relations: Mutex::new(HashMap::new()),
        }
    }

    fn update(&self, labels: &[&str]) {
        self.gauge.with_label_values(labels).set(1.0);
        let deadline = Instant::now() + self.expire_time;
        let key = labels.join("_");
        let mut relations = self.relations.lock().unwrap();
        match relations.get_mut(&key) {
            Some(r) => r.deadline = deadline,
            None => {
                relations.insert(
                    key,
                    Relation {
                        labels: labels.iter().map(|&s| s.to_owned()).collect(),
                        deadline,
                    },
                );
            }
        }
    }

    // Sample removal happens under the relations lock so a concurrent update
    // for the same tuple cannot interleave between gauge and map.
    fn sweep(&self) {
        let now = Instant::now();
        let mut relations = self.relations.lock().unwrap();
        relations.retain(|_, r| {
            if r.deadline > now {
                return true;
            }
            let labels: Vec<&str> = r.labels.iter().map(String::as_str).collect();
            let _ = self.gauge.remove_label_values(&labels);
            false
        });
    }
}

/// Prometheus series derived from decoded requests.
pub struct Storage {
    producer_topic_relation: ExpiringGaugeVec,
    consumer_topic_relation: ExpiringGaugeVec,
    requests_received_total: IntCounter,
    request_decode_time_seconds: Histogram,
    request_size_bytes: Histogram,
    connections_count: IntGauge,
}

impl Storage {
    pub fn new(registry: &Registry, expire_time: Duration) -> prometheus::Result<Storage> {
        let producer_topic_relation = GaugeVec::new(
            Opts::new(
                "producer_topic_relation_info",
                "Relation information between producer and topic",
            )
            .namespace(NAMESPACE),
            &["producer", "topic"],
        )?;
        let consumer_topic_relation = GaugeVec::new(
            Opts::new(
                "consumer_topic_relation_info",
                "Relation information between consumer and topic",
            )
            .namespace(NAMESPACE),
            &["consumer", "topic"],
        )?;
        let requests_received_total = IntCounter::with_opts(
            Opts::new("requests_received_total", "Total received requests").namespace(NAMESPACE),
        )?;
        let request_decode_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "request_decode_time_seconds",
                "Spent time to decode request in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 0.1, 1.0]),
        )?;
        let request_size_bytes = Histogram::with_opts(
            HistogramOpts::new("request_size_bytes", "Request size in bytes")
                .namespace(NAMESPACE)
                .buckets(vec![
                    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
                ]),
        )?;
        let connections_count = IntGauge::with_opts(
            Opts::new("connections_count", "Connections count").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(producer_topic_relation.clone()))?;
        registry.register(Box::new(consumer_topic_relation.clone()))?;
        registry.register(Box::new(requests_received_total.clone()))?;
        registry.register(Box::new(request_decode_time_seconds.clone()))?;
        registry.register(Box::new(request_size_bytes.clone()))?;
        registry.register(Box::new(connections_count.clone()))?;

        Ok(Storage {
            producer_topic_relation: ExpiringGaugeVec::new(producer_topic_relation, expire_time),
            consumer_topic_relation: ExpiringGaugeVec::new(consumer_topic_relation, expire_time),
            requests_received_total,
            request_decode_time_seconds,
            request_size_bytes,
            connections_count,
        })
    }

    pub fn add_producer_topic_relation(&self, producer: &str, topic: &str) {
        self.producer_topic_relation.update(&[producer, topic]);
    }

    pub fn add_consumer_topic_relation(&self, consumer: &str, topic: &str) {
        self.consumer_topic_relation.update(&[consumer, topic]);
    }

    pub fn inc_requests_received(&self) {
        self.requests_received_total.inc();
    }

    pub fn observe_decode_time(&self, seconds: f64) {
        self.request_decode_time_seconds.observe(seconds);
    }

    pub fn observe_request_size(&self, bytes: f64) {
        self.request_size_bytes.observe(bytes);
    }

    pub fn inc_connections(&self) {
        self.connections_count.inc();
    }

    /// Drops relation samples whose expiration deadline passed.
    pub fn sweep_expired(&self) {
        self.producer_topic_relation.sweep();
        self.consumer_topic_relation.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_count(registry: &Registry, name: &str) -> usize {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric().len())
            .unwrap_or(0)
    }

    #[test]
    fn relation_metrics_appear_on_update() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, DEFAULT_EXPIRE_TIME).unwrap();
        storage.add_producer_topic_relation("10.0.0.1", "orders");
        storage.add_consumer_topic_relation("10.0.0.2", "orders");

        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            1
        );
        assert_eq!(
            sample_count(&registry, "kafkaprobe_consumer_topic_relation_info"),
            1
        );
    }

    #[test]
    fn expired_relation_is_swept_and_recreated() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, Duration::ZERO).unwrap();
        storage.add_producer_topic_relation("producerA", "topicT");

        storage.sweep_expired();
        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            0
        );

        // a later update recreates the sample
        storage.add_producer_topic_relation("producerA", "topicT");
        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            1
        );
    }

    #[test]
    fn update_refreshes_deadline() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, Duration::from_secs(300)).unwrap();
        storage.add_producer_topic_relation("p", "t");
        storage.add_producer_topic_relation("p", "t");
        storage.sweep_expired();
        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            1
        );
        let relations = storage.producer_topic_relation.relations.lock().unwrap();
        assert_eq!(relations.len(), 1);
    }

    #[test]
    fn counters_and_observations() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, DEFAULT_EXPIRE_TIME).unwrap();
        storage.inc_requests_received();
        storage.inc_requests_received();
        storage.inc_connections();
        storage.observe_decode_time(0.0001);
        storage.observe_request_size(512.0);

        assert_eq!(storage.requests_received_total.get(), 2);
        assert_eq!(storage.connections_count.get(), 1);
        assert_eq!(storage.request_decode_time_seconds.get_sample_count(), 1);
        assert_eq!(storage.request_size_bytes.get_sample_count(), 1);
    }

    #[test]
    fn sweep_is_idempotent() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, Duration::ZERO).unwrap();
        storage.add_consumer_topic_relation("c", "t");
        storage.sweep_expired();
        storage.sweep_expired();
        assert_eq!(
            sample_count(&registry, "kafkaprobe_consumer_topic_relation_info"),
            0
        );
    }
}
