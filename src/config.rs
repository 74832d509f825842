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

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_BROKER_PORT: u16 = 9092;
pub const DEFAULT_SNAP_LEN: i32 = 16 << 10;

/// Resolved runtime configuration handed into constructors; all values come
/// from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    pub interface: String,
    pub bpf: String,
    pub snap_len: i32,
    pub verbose: bool,
    /// Maintain the per-client activity table alongside the metrics.
    pub client_print: bool,
    /// Raw flow accounting instead of protocol decoding.
    pub flow_mode: bool,
    /// Substring filter on request type names for printed output.
    pub type_filter: String,
    /// Dump a matching request body as JSON at most this often; zero is off.
    pub print_json_every: Duration,
    pub listen_addr: SocketAddr,
    pub metrics_expire_time: Duration,
}

/// An explicit filter wins; otherwise one is synthesized from the broker
/// port.
pub fn synthesize_bpf(explicit: Option<&str>, port: u16) -> String {
    match explicit {
        Some(bpf) => bpf.to_owned(),
        None => format!("tcp and dst port {}", port),
    }
}

/// Accepts `:9870` shorthand for all interfaces as well as a full address.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_owned()
    };
    full.parse()
        .map_err(|_| Error::ListenAddr(addr.to_owned()))
}
