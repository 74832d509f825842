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

mod client_stat;
mod flow_table;
mod runner;

pub use client_stat::{ClientStat, StatSnapshot, RECYCLE_GRACE};
pub use flow_table::{Flow, FlowTable, FLOW_SWEEP_GRACE};
pub use runner::KafkaStreamFactory;
