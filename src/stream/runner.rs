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

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::common::FlowKey;
use crate::metrics::Storage;
use crate::protocol::{decode_request, Error, RequestBody};
use crate::reassembly::{stream_pair, StreamFactory, StreamReader, StreamSink};

use super::ClientStat;

// Matches the reader buffer the decoder framing works against.
const STREAM_BUF_CAPACITY: usize = 64 << 10;

/// Spawns one decoder thread per half-connection. Every stream feeds the
/// metrics storage; with a client-stat registry attached it also maintains
/// the activity table and prints newly seen (connection, request type) pairs.
pub struct KafkaStreamFactory {
    metrics: Arc<Storage>,
    stat: Option<Arc<ClientStat>>,
    verbose: bool,
    type_filter: String,
    print_json_every: Duration,
}

impl KafkaStreamFactory {
    pub fn new(metrics: Arc<Storage>, verbose: bool) -> Self {
        Self {
            metrics,
            stat: None,
            verbose,
            type_filter: String::new(),
            print_json_every: Duration::ZERO,
        }
    }

    pub fn with_client_stat(
        mut self,
        stat: Arc<ClientStat>,
        type_filter: &str,
        print_json_every: Duration,
    ) -> Self {
        self.stat = Some(stat);
        self.type_filter = type_filter.to_lowercase();
        self.print_json_every = print_json_every;
        self
    }
}

impl StreamFactory for KafkaStreamFactory {
    fn new_stream(&self, key: &FlowKey) -> StreamSink {
        let (sink, reader) = stream_pair();
        let ctx = StreamContext {
            key: *key,
            metrics: self.metrics.clone(),
            stat: self.stat.clone(),
            verbose: self.verbose,
            type_filter: self.type_filter.clone(),
            print_json_every: self.print_json_every,
        };
        // the reader must be drained or the assembler starts dropping pages
        thread::Builder::new()
            .name("kafka-stream".to_owned())
            .spawn(move || run_stream(ctx, reader))
            .unwrap();
        sink
    }
}

pub(crate) struct StreamContext {
    pub(crate) key: FlowKey,
    pub(crate) metrics: Arc<Storage>,
    pub(crate) stat: Option<Arc<ClientStat>>,
    pub(crate) verbose: bool,
    pub(crate) type_filter: String,
    pub(crate) print_json_every: Duration,
}

pub(crate) fn run_stream(ctx: StreamContext, reader: StreamReader) {
    let src = ctx.key.src();
    let dst = ctx.key.dst();
    // relation metrics label the client by address only, without the port
    let client_ip = ctx.key.src_ip.to_string();
    info!("conn: {} -> {}", src, dst);

    let mut reader = io::BufReader::with_capacity(STREAM_BUF_CAPACITY, reader);
    ctx.metrics.inc_connections();

    let mut last_json_dump = Instant::now();
    loop {
        let started = Instant::now();
        let (req, consumed) = match decode_request(&mut reader) {
            Ok(ok) => ok,
            Err(Error::EndOfStream) | Err(Error::UnexpectedEndOfStream) => {
                info!("conn: {} -> {} EOF", src, dst);
                if let Some(stat) = &ctx.stat {
                    stat.mark_eof(&src, &dst);
                }
                return;
            }
            Err(Error::PacketDecoding { message, consumed }) => {
                info!(
                    "unable to read request to broker - skipping packet: {}",
                    message
                );
                if consumed > 0 {
                    let mut sink = io::sink();
                    if let Err(e) = io::copy(&mut (&mut reader).take(consumed as u64), &mut sink) {
                        warn!("could not discard: {}", e);
                    }
                }
                continue;
            }
            Err(e) => {
                warn!("conn: {} -> {} terminated: {}", src, dst, e);
                return;
            }
        };

        ctx.metrics.inc_requests_received();
        ctx.metrics.observe_decode_time(started.elapsed().as_secs_f64());
        ctx.metrics.observe_request_size(consumed as f64);

        if ctx.verbose {
            debug!(
                "got request, key: {}, version: {}, correlationID: {}, clientID: {:?}",
                req.api_key, req.api_version, req.correlation_id, req.client_id
            );
        }

        let type_name = req.body.type_name();
        let topics = req.body.extract_topics();

        match &req.body {
            RequestBody::Produce(_) => {
                for topic in &topics {
                    if ctx.verbose {
                        debug!("client {} wrote to topic {}", src, topic);
                    }
                    ctx.metrics.add_producer_topic_relation(&client_ip, topic);
                }
            }
            RequestBody::Fetch(_) => {
                for topic in &topics {
                    if ctx.verbose {
                        debug!("client {} read from topic {}", src, topic);
                    }
                    ctx.metrics.add_consumer_topic_relation(&client_ip, topic);
                }
            }
            _ => {}
        }

        let Some(stat) = &ctx.stat else { continue };
        let client_id = req.client_id.as_deref().unwrap_or_default();
        let is_print_type =
            ctx.type_filter.is_empty() || type_name.to_lowercase().contains(&ctx.type_filter);

        if stat.observe(&src, &dst, client_id, type_name, &topics, consumed) && is_print_type {
            info!(
                "conn: {} -> {}, type: {}, topics: {:?}, correlationID: {}, clientID: {}",
                src, dst, type_name, topics, req.correlation_id, client_id
            );
        }

        if is_print_type
            && !ctx.print_json_every.is_zero()
            && last_json_dump.elapsed() > ctx.print_json_every
        {
            last_json_dump = Instant::now();
            match serde_json::to_string(&req.body) {
                Ok(json) => info!("{}: {}", type_name, json),
                Err(e) => warn!("json marshal failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use prometheus::Registry;

    use crate::metrics::DEFAULT_EXPIRE_TIME;
    use crate::protocol::request::tests::encode_frame;

    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 50000,
            dst_port: 9092,
        }
    }

    fn context(registry: &Registry) -> (StreamContext, Arc<ClientStat>) {
        let metrics = Arc::new(Storage::new(registry, DEFAULT_EXPIRE_TIME).unwrap());
        let stat = Arc::new(ClientStat::new());
        (
            StreamContext {
                key: key(),
                metrics,
                stat: Some(stat.clone()),
                verbose: false,
                type_filter: String::new(),
                print_json_every: Duration::ZERO,
            },
            stat,
        )
    }

    fn produce_frame(correlation_id: i32, topic: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1i16.to_be_bytes()); // acks
        body.extend_from_slice(&1000i32.to_be_bytes()); // timeout
        body.extend_from_slice(&1i32.to_be_bytes()); // one topic
        body.extend_from_slice(&(topic.len() as i16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(&1i32.to_be_bytes()); // one partition
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes()); // empty records blob
        encode_frame(0, 0, correlation_id, Some("writer"), &body)
    }

    fn sample_count(registry: &Registry, name: &str) -> usize {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric().len())
            .unwrap_or(0)
    }

    fn counter_value(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric()[0].get_counter().get_value())
            .unwrap_or_default()
    }

    #[test]
    fn requests_feed_stats_and_metrics() {
        let registry = Registry::new();
        let (ctx, stat) = context(&registry);
        let (sink, reader) = stream_pair();
        sink.deliver(&produce_frame(1, "orders"));
        sink.deliver(&produce_frame(2, "orders"));
        drop(sink);

        run_stream(ctx, reader);

        let snap = stat.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].req_type, "Produce");
        assert_eq!(snap[0].requests, 2);
        assert_eq!(snap[0].topics, vec!["orders"]);
        assert!(snap[0].eof, "stream end marks the entry");

        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            1
        );
    }

    #[test]
    fn frames_split_across_pages_decode() {
        let registry = Registry::new();
        let (ctx, stat) = context(&registry);
        let (sink, reader) = stream_pair();
        let frame = produce_frame(1, "orders");
        let (a, b) = frame.split_at(7);
        sink.deliver(a);
        sink.deliver(b);
        drop(sink);

        run_stream(ctx, reader);
        assert_eq!(stat.snapshot()[0].requests, 1);
    }

    #[test]
    fn crc_mismatch_observes_nothing() {
        use crate::protocol::record_batch::tests::{encode_batch, encode_record};
        use crate::protocol::compression::CompressionCodec;

        let registry = Registry::new();
        let (ctx, stat) = context(&registry);

        let mut blob = encode_batch(
            CompressionCodec::None,
            1,
            &encode_record(Some(b"k"), Some(b"v")),
        );
        let n = blob.len();
        blob[n - 1] ^= 0x01; // breaks the Castagnoli crc

        let mut body = Vec::new();
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&1000i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&6i16.to_be_bytes());
        body.extend_from_slice(b"orders");
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&(blob.len() as i32).to_be_bytes());
        body.extend_from_slice(&blob);

        let (sink, reader) = stream_pair();
        sink.deliver(&encode_frame(0, 0, 1, Some("writer"), &body));
        drop(sink);

        run_stream(ctx, reader);

        assert!(stat.snapshot().is_empty());
        assert_eq!(
            counter_value(&registry, "kafkaprobe_requests_received_total"),
            0.0
        );
        assert_eq!(
            sample_count(&registry, "kafkaprobe_producer_topic_relation_info"),
            0
        );
    }

    #[test]
    fn corrupt_frame_creates_no_stat_entry() {
        let registry = Registry::new();
        let (ctx, stat) = context(&registry);
        let (sink, reader) = stream_pair();
        let mut frame = produce_frame(1, "orders");
        let n = frame.len();
        frame[n - 10] ^= 0xff; // break the topic array
        frame.truncate(n - 8);
        // fix the frame length so the corruption hits the body decoder
        let new_len = (frame.len() - 4) as i32;
        frame[..4].copy_from_slice(&new_len.to_be_bytes());
        sink.deliver(&frame);
        drop(sink);

        run_stream(ctx, reader);

        assert!(stat.snapshot().is_empty());
        assert_eq!(
            counter_value(&registry, "kafkaprobe_requests_received_total"),
            0.0
        );
    }
}
