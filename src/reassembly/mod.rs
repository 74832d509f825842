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

//! Per-direction TCP stream reassembly feeding one consumer per
//! half-connection. Memory is bounded by page caps; when a cap is hit the
//! stream skips the hole instead of buffering further, and the downstream
//! decoder resynchronizes.

mod reader;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;

use crate::common::{FlowKey, MetaPacket};
use stream::HalfConnection;

pub use reader::{stream_pair, StreamReader, StreamSink};

pub const MAX_BUFFERED_PAGES_TOTAL: usize = 1000;
pub const MAX_BUFFERED_PAGES_PER_CONNECTION: usize = 1;

/// Invents the consumer for each new half-connection and hands back the sink
/// the assembler will write into. Implementations spawn their own consumer
/// task; the returned sink must be drained promptly by it.
pub trait StreamFactory: Send + Sync {
    fn new_stream(&self, key: &FlowKey) -> StreamSink;
}

pub struct StreamPool {
    factory: Arc<dyn StreamFactory>,
}

impl StreamPool {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        Self { factory }
    }
}

pub struct Assembler {
    pool: StreamPool,
    conns: HashMap<FlowKey, HalfConnection>,
    total_buffered: usize,
    pub max_buffered_pages_total: usize,
    pub max_buffered_pages_per_connection: usize,
}

impl Assembler {
    pub fn new(pool: StreamPool) -> Self {
        Self {
            pool,
            conns: HashMap::new(),
            total_buffered: 0,
            max_buffered_pages_total: MAX_BUFFERED_PAGES_TOTAL,
            max_buffered_pages_per_connection: MAX_BUFFERED_PAGES_PER_CONNECTION,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn assemble_with_timestamp(&mut self, packet: &MetaPacket) {
        let factory = &self.pool.factory;
        let conn = self.conns.entry(packet.flow).or_insert_with(|| {
            debug!("new half-connection {}", packet.flow);
            HalfConnection::new(factory.new_stream(&packet.flow), packet.timestamp)
        });
        conn.last_seen = packet.timestamp;

        let before = conn.buffered();
        let can_buffer = before < self.max_buffered_pages_per_connection
            && self.total_buffered < self.max_buffered_pages_total;
        conn.accept(packet.seq, packet.payload, packet.syn, can_buffer);
        self.total_buffered = self.total_buffered - before + conn.buffered();

        if packet.fin || packet.rst {
            self.close(&packet.flow);
        }
    }

    /// Ends every half-connection that saw no segment since `deadline`,
    /// delivering parked pages and then end-of-stream to its consumer.
    pub fn flush_older_than(&mut self, deadline: SystemTime) {
        let idle: Vec<FlowKey> = self
            .conns
            .iter()
            .filter(|(_, c)| c.last_seen < deadline)
            .map(|(k, _)| *k)
            .collect();
        for key in idle {
            debug!("flushing idle half-connection {}", key);
            self.close(&key);
        }
    }

    fn close(&mut self, key: &FlowKey) {
        if let Some(mut conn) = self.conns.remove(key) {
            self.total_buffered -= conn.buffered();
            conn.flush_buffered();
            if conn.dropped_pages > 0 {
                debug!("{}: dropped {} pages", key, conn.dropped_pages);
            }
        }
    }
}
