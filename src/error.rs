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

use thiserror::Error;

/// Infrastructure failures. Unlike per-frame decode errors these are fatal:
/// the process reports them and exits non-zero.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open capture on interface {interface:?}: {source}")]
    Capture {
        interface: String,
        source: pcap::Error,
    },
    #[error("failed to set bpf filter {filter:?}: {source}")]
    Bpf { filter: String, source: pcap::Error },
    #[error("invalid listen address {0:?}")]
    ListenAddr(String),
    #[error("failed to bind http server on {addr}: {source}")]
    Bind { addr: String, source: hyper::Error },
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
