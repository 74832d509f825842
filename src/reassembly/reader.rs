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
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

// Reassembled pages in flight between the assembler and one stream consumer.
// The consumer must drain its reader; a full channel drops pages (the feed is
// lossy by contract and the decoder resynchronizes).
const STREAM_CHANNEL_PAGES: usize = 512;

pub fn stream_pair() -> (StreamSink, StreamReader) {
    let (tx, rx) = sync_channel(STREAM_CHANNEL_PAGES);
    (
        StreamSink { tx },
        StreamReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

/// Write side handed to the assembler. Dropping it ends the stream.
pub struct StreamSink {
    tx: SyncSender<Vec<u8>>,
}

impl StreamSink {
    /// Returns false when the page was dropped (consumer gone or lagging).
    pub(crate) fn deliver(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Blocking reader over the reassembled byte stream of one half-connection.
/// Returns 0 (end of stream) once the assembler drops the sink.
pub struct StreamReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() {
            match self.rx.recv() {
                Ok(page) => {
                    self.current = page;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
