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

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::info;
use prometheus::Registry;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::metrics::{Storage, EXPIRE_SWEEP_INTERVAL};
use crate::reassembly::{Assembler, StreamPool};
use crate::server::{ApiServer, ServerState};
use crate::stream::{ClientStat, FlowTable, KafkaStreamFactory, FLOW_SWEEP_GRACE, RECYCLE_GRACE};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
// Half-connections idle longer than this are flushed by the minute sweep.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Wires capture, reassembly, decoding, registries and the HTTP surface
/// together, and owns the background sweepers.
pub struct Probe {
    metrics: Arc<Storage>,
    client_stat: Option<Arc<ClientStat>>,
    flow_table: Option<Arc<FlowTable>>,
    assembler: Option<Arc<Mutex<Assembler>>>,
    dispatcher: Dispatcher,
    server: ApiServer,
    running: Arc<(Mutex<bool>, Condvar)>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl Probe {
    pub fn new(config: Config) -> Result<Probe> {
        let registry = Registry::new();
        let metrics = Arc::new(Storage::new(&registry, config.metrics_expire_time)?);

        let mut client_stat = None;
        let mut flow_table = None;
        let mut assembler = None;

        let dispatcher = if config.flow_mode {
            let table = Arc::new(FlowTable::new());
            flow_table = Some(table.clone());
            Dispatcher::new_flow(&config, table)?
        } else {
            let mut factory = KafkaStreamFactory::new(metrics.clone(), config.verbose);
            if config.client_print {
                let stat = Arc::new(ClientStat::new());
                factory = factory.with_client_stat(
                    stat.clone(),
                    &config.type_filter,
                    config.print_json_every,
                );
                client_stat = Some(stat);
            }
            let asm = Arc::new(Mutex::new(Assembler::new(StreamPool::new(Arc::new(
                factory,
            )))));
            assembler = Some(asm.clone());
            Dispatcher::new(&config, asm)?
        };

        let server = ApiServer::new(
            config.listen_addr,
            ServerState {
                registry,
                client_stat: client_stat.clone(),
                flow_table: flow_table.clone(),
            },
        );

        Ok(Probe {
            metrics,
            client_stat,
            flow_table,
            assembler,
            dispatcher,
            server,
            running: Arc::new((Mutex::new(false), Condvar::new())),
            sweepers: Mutex::new(Vec::new()),
        })
    }

    pub fn start(&self) -> Result<()> {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return Ok(());
            }
            *started = true;
        }

        self.server.start()?;
        self.dispatcher.start();

        let mut sweepers = self.sweepers.lock().unwrap();

        let metrics = self.metrics.clone();
        sweepers.push(spawn_sweeper(
            "metric-expiration",
            EXPIRE_SWEEP_INTERVAL,
            self.running.clone(),
            move || metrics.sweep_expired(),
        ));

        if let Some(stat) = self.client_stat.clone() {
            sweepers.push(spawn_sweeper(
                "stat-recycler",
                SWEEP_INTERVAL,
                self.running.clone(),
                move || stat.sweep(RECYCLE_GRACE),
            ));
        }

        if let Some(asm) = self.assembler.clone() {
            sweepers.push(spawn_sweeper(
                "connection-flusher",
                SWEEP_INTERVAL,
                self.running.clone(),
                move || {
                    let deadline = SystemTime::now() - CONNECTION_IDLE_TIMEOUT;
                    asm.lock().unwrap().flush_older_than(deadline);
                },
            ));
        }

        if let Some(table) = self.flow_table.clone() {
            sweepers.push(spawn_sweeper(
                "flow-sweeper",
                SWEEP_INTERVAL,
                self.running.clone(),
                move || table.sweep(FLOW_SWEEP_GRACE),
            ));
        }

        info!("probe started");
        Ok(())
    }

    pub fn stop(&self) {
        {
            let (stopped, timer) = &*self.running;
            let mut stopped = stopped.lock().unwrap();
            if !*stopped {
                return;
            }
            *stopped = false;
            timer.notify_all();
        }

        self.dispatcher.stop();
        self.server.stop();
        for sweeper in self.sweepers.lock().unwrap().drain(..) {
            let _ = sweeper.join();
        }
        info!("probe stopped");
    }
}

fn spawn_sweeper(
    name: &'static str,
    interval: Duration,
    running: Arc<(Mutex<bool>, Condvar)>,
    f: impl Fn() + Send + 'static,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            loop {
                {
                    let (lock, timer) = &*running;
                    let mut run = lock.lock().unwrap();
                    if !*run {
                        break;
                    }
                    run = timer.wait_timeout(run, interval).unwrap().0;
                    if !*run {
                        break;
                    }
                }
                f();
            }
            info!("{} exited", name);
        })
        .unwrap()
}
