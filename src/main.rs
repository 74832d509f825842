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

use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use flexi_logger::Logger;
#[cfg(unix)]
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use kafkaprobe::{config, Config, Probe};

#[derive(Parser)]
#[clap(name = "kafkaprobe", about = "Passive Kafka wire protocol observer")]
struct Opts {
    /// Interface to get packets from
    #[clap(short = 'i', long = "interface", default_value = "eth0")]
    interface: String,

    /// BPF expression; defaults to "tcp and dst port <port>"
    #[clap(long = "bpf")]
    bpf: Option<String>,

    /// Broker port, used to synthesize the BPF filter when none is given
    #[clap(short = 'p', long = "port", default_value_t = config::DEFAULT_BROKER_PORT)]
    port: u16,

    /// SnapLen for pcap packet capture
    #[clap(long = "snap", default_value_t = config::DEFAULT_SNAP_LEN)]
    snap_len: i32,

    /// Logs every packet in great detail
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,

    /// Maintain and print the per-client activity table
    #[clap(
        short = 's',
        long = "client-print",
        action = ArgAction::Set,
        default_value_t = true
    )]
    client_print: bool,

    /// Raw flow accounting instead of protocol decoding
    #[clap(long = "flow")]
    flow: bool,

    /// Print only request types containing this substring
    #[clap(short = 't', long = "type-filter", default_value = "")]
    type_filter: String,

    /// Dump matching request bodies as JSON at most this often; 0s disables
    #[clap(long = "print-json-every", value_parser = humantime::parse_duration, default_value = "0s")]
    print_json_every: Duration,

    /// Address on which the probe serves metrics and snapshots
    #[clap(long = "addr", default_value = ":9870")]
    listen_addr: String,

    /// Expiration time of relation metrics
    #[clap(long = "metrics-expire-time", value_parser = humantime::parse_duration, default_value = "5m")]
    metrics_expire_time: Duration,
}

#[cfg(unix)]
fn wait_on_signals() {
    let mut signals = Signals::new(TERM_SIGNALS).unwrap();
    signals.forever().next();
    signals.handle().close();
}

#[cfg(not(unix))]
fn wait_on_signals() {}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // the handle keeps the logger alive for the lifetime of the process
    let _logger = Logger::try_with_str(if opts.verbose { "debug" } else { "info" })?.start()?;

    let config = Config {
        bpf: config::synthesize_bpf(opts.bpf.as_deref(), opts.port),
        listen_addr: config::parse_listen_addr(&opts.listen_addr)?,
        interface: opts.interface,
        snap_len: opts.snap_len,
        verbose: opts.verbose,
        client_print: opts.client_print,
        flow_mode: opts.flow,
        type_filter: opts.type_filter,
        print_json_every: opts.print_json_every,
        metrics_expire_time: opts.metrics_expire_time,
    };

    let probe = Probe::new(config)?;
    probe.start()?;
    wait_on_signals();
    probe.stop();

    Ok(())
}
