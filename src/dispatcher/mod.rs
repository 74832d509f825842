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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};

use log::{debug, error, info, warn};
use pcap::{Active, Capture};

use crate::common::MetaPacket;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reassembly::Assembler;
use crate::stream::FlowTable;

enum DispatcherFlavor {
    /// Reassembles client streams and feeds the per-connection decoders.
    Reassembly(Arc<Mutex<Assembler>>),
    /// Raw per-flow byte accounting, no reassembly.
    Flow(Arc<FlowTable>),
}

/// Owns the capture handle and drains it on a dedicated thread. The handle
/// blocks forever waiting for traffic, so the thread is detached and ends
/// with the process.
pub struct Dispatcher {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    capture: Mutex<Option<Capture<Active>>>,
    flavor: Mutex<Option<DispatcherFlavor>>,
    verbose: bool,
}

impl Dispatcher {
    pub fn new(config: &Config, assembler: Arc<Mutex<Assembler>>) -> Result<Self> {
        Self::with_flavor(config, DispatcherFlavor::Reassembly(assembler))
    }

    pub fn new_flow(config: &Config, table: Arc<FlowTable>) -> Result<Self> {
        Self::with_flavor(config, DispatcherFlavor::Flow(table))
    }

    fn with_flavor(config: &Config, flavor: DispatcherFlavor) -> Result<Self> {
        let mut capture = Capture::from_device(config.interface.as_str())
            .map_err(|source| Error::Capture {
                interface: config.interface.clone(),
                source,
            })?
            .snaplen(config.snap_len)
            .promisc(true)
            .timeout(0) // block forever
            .open()
            .map_err(|source| Error::Capture {
                interface: config.interface.clone(),
                source,
            })?;
        capture
            .filter(&config.bpf, true)
            .map_err(|source| Error::Bpf {
                filter: config.bpf.clone(),
                source,
            })?;
        info!(
            "starting capture on interface {:?} with filter {:?}",
            config.interface, config.bpf
        );
        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            capture: Mutex::new(Some(capture)),
            flavor: Mutex::new(Some(flavor)),
            verbose: config.verbose,
        })
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let Some(mut capture) = self.capture.lock().unwrap().take() else {
            warn!("dispatcher already consumed its capture handle");
            return;
        };
        let flavor = self.flavor.lock().unwrap().take().unwrap();
        let running = self.running.clone();
        let verbose = self.verbose;

        let thread = thread::Builder::new()
            .name("dispatcher".to_owned())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let packet = match capture.next_packet() {
                        Ok(p) => p,
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(e) => {
                            error!("capture terminated: {}", e);
                            break;
                        }
                    };
                    let timestamp = UNIX_EPOCH
                        + Duration::new(
                            packet.header.ts.tv_sec as u64,
                            (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                        );
                    let Some(meta) = MetaPacket::parse(packet.data, timestamp) else {
                        if verbose {
                            debug!("unusable packet ({} bytes)", packet.data.len());
                        }
                        continue;
                    };
                    if verbose {
                        debug!("{} seq={} len={}", meta.flow, meta.seq, meta.payload.len());
                    }
                    match &flavor {
                        DispatcherFlavor::Reassembly(assembler) => {
                            assembler.lock().unwrap().assemble_with_timestamp(&meta);
                        }
                        DispatcherFlavor::Flow(table) => {
                            table.update(
                                &meta.flow.src(),
                                &meta.flow.dst(),
                                meta.payload.len(),
                                meta.fin || meta.rst,
                            );
                        }
                    }
                }
                info!("dispatcher exited");
            })
            .unwrap();
        self.thread.lock().unwrap().replace(thread);
        info!("dispatcher started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        // next_packet blocks indefinitely on a quiet interface; the thread is
        // left to die with the process rather than joined
        if let Some(thread) = self.thread.lock().unwrap().take() {
            drop(thread);
        }
        info!("dispatcher stopped");
    }
}
