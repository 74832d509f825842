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

use std::collections::BTreeMap;
use std::time::SystemTime;

use super::reader::StreamSink;

/// Sequencing state for one half-connection. Segments are delivered to the
/// sink in sequence order; a bounded number of out-of-order pages is parked
/// until the hole fills or the budget forces a skip.
pub(crate) struct HalfConnection {
    sink: StreamSink,
    next_seq: Option<u32>,
    pages: BTreeMap<u32, Vec<u8>>,
    pub(crate) last_seen: SystemTime,
    pub(crate) dropped_pages: u64,
}

impl HalfConnection {
    pub(crate) fn new(sink: StreamSink, last_seen: SystemTime) -> Self {
        Self {
            sink,
            next_seq: None,
            pages: BTreeMap::new(),
            last_seen,
            dropped_pages: 0,
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn accept(&mut self, seq: u32, data: &[u8], syn: bool, can_buffer: bool) {
        if syn && data.is_empty() {
            self.next_seq = Some(seq.wrapping_add(1));
            return;
        }
        if data.is_empty() {
            return;
        }
        let expected = match self.next_seq {
            // first observed data positions the stream
            None => seq,
            Some(e) => e,
        };
        let diff = seq.wrapping_sub(expected) as i32;
        if diff == 0 {
            self.deliver(data);
            self.next_seq = Some(seq.wrapping_add(data.len() as u32));
            self.drain_ready();
        } else if diff < 0 {
            // retransmission; deliver only bytes past what was already seen
            let skip = diff.unsigned_abs() as usize;
            if skip < data.len() {
                self.deliver(&data[skip..]);
                self.next_seq = Some(seq.wrapping_add(data.len() as u32));
                self.drain_ready();
            }
        } else if can_buffer {
            self.pages.entry(seq).or_insert_with(|| data.to_vec());
        } else {
            // page budget exhausted: give up on the hole and jump forward
            self.flush_buffered();
            self.deliver(data);
            self.next_seq = Some(seq.wrapping_add(data.len() as u32));
        }
    }

    /// Delivers whatever is parked, accepting the gaps. The downstream
    /// decoder resynchronizes on frame boundaries.
    pub(crate) fn flush_buffered(&mut self) {
        let base = self.next_seq.unwrap_or_default();
        let mut pages: Vec<(u32, Vec<u8>)> = std::mem::take(&mut self.pages).into_iter().collect();
        pages.sort_by_key(|(s, _)| s.wrapping_sub(base));
        for (s, page) in pages {
            self.deliver(&page);
            self.next_seq = Some(s.wrapping_add(page.len() as u32));
        }
    }

    fn drain_ready(&mut self) {
        while let Some(expected) = self.next_seq {
            let ready = self
                .pages
                .keys()
                .copied()
                .find(|s| (s.wrapping_sub(expected) as i32) <= 0);
            let Some(s) = ready else { break };
            let page = self.pages.remove(&s).unwrap();
            let skip = (expected.wrapping_sub(s) as i32).unsigned_abs() as usize;
            if skip < page.len() {
                self.deliver(&page[skip..]);
                self.next_seq = Some(s.wrapping_add(page.len() as u32));
            }
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        if !self.sink.deliver(data) {
            self.dropped_pages += 1;
        }
    }
}
