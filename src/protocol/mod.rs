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

//! Decoders for the client side of the Kafka wire protocol.
//!
//! The entry point is [request::decode_request], which frames and decodes one
//! request from a reassembled client byte stream. Everything below it works on
//! an in-memory frame through the cursor in [decoder::Decoder].

pub mod api_versions;
pub mod compression;
pub mod crc_field;
pub mod decoder;
pub mod fetch;
pub mod list_groups;
pub mod message_set;
pub mod metadata;
pub mod produce;
pub mod record_batch;
pub mod records;
pub mod request;

use std::borrow::Cow;

use thiserror::Error;

pub use request::{decode_request, Request, RequestBody};

#[derive(Debug, Error)]
pub enum Error {
    // The byte source ended on a frame boundary.
    #[error("end of stream")]
    EndOfStream,
    // The byte source ended inside a frame.
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("insufficient data to decode packet, more bytes expected")]
    InsufficientData,
    #[error("invalid data: {0}")]
    InvalidData(Cow<'static, str>),
    #[error("crc mismatch: recorded {recorded:#010x}, computed {computed:#010x}")]
    CrcMismatch { recorded: u32, computed: u32 },
    #[error("packet decoding failed: {message}")]
    PacketDecoding { message: String, consumed: usize },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const API_KEY_PRODUCE: i16 = 0;
pub const API_KEY_FETCH: i16 = 1;
pub const API_KEY_METADATA: i16 = 3;
pub const API_KEY_LIST_GROUPS: i16 = 16;
pub const API_KEY_API_VERSIONS: i16 = 18;

// https://kafka.apache.org/protocol.html#protocol_api_keys
const API_KEY_NAMES: [&str; 68] = [
    "Produce",
    "Fetch",
    "ListOffsets",
    "Metadata",
    "LeaderAndIsr",
    "StopReplica",
    "UpdateMetadata",
    "ControlledShutdown",
    "OffsetCommit",
    "OffsetFetch",
    "FindCoordinator",
    "JoinGroup",
    "Heartbeat",
    "LeaveGroup",
    "SyncGroup",
    "DescribeGroups",
    "ListGroups",
    "SaslHandshake",
    "ApiVersions",
    "CreateTopics",
    "DeleteTopics",
    "DeleteRecords",
    "InitProducerId",
    "OffsetForLeaderEpoch",
    "AddPartitionsToTxn",
    "AddOffsetsToTxn",
    "EndTxn",
    "WriteTxnMarkers",
    "TxnOffsetCommit",
    "DescribeAcls",
    "CreateAcls",
    "DeleteAcls",
    "DescribeConfigs",
    "AlterConfigs",
    "AlterReplicaLogDirs",
    "DescribeLogDirs",
    "SaslAuthenticate",
    "CreatePartitions",
    "CreateDelegationToken",
    "RenewDelegationToken",
    "ExpireDelegationToken",
    "DescribeDelegationToken",
    "DeleteGroups",
    "ElectLeaders",
    "IncrementalAlterConfigs",
    "AlterPartitionReassignments",
    "ListPartitionReassignments",
    "OffsetDelete",
    "DescribeClientQuotas",
    "AlterClientQuotas",
    "DescribeUserScramCredentials",
    "AlterUserScramCredentials",
    "Vote",
    "BeginQuorumEpoch",
    "EndQuorumEpoch",
    "DescribeQuorum",
    "AlterPartition",
    "UpdateFeatures",
    "Envelope",
    "FetchSnapshot",
    "DescribeCluster",
    "DescribeProducers",
    "BrokerRegistration",
    "BrokerHeartbeat",
    "UnregisterBroker",
    "DescribeTransactions",
    "ListTransactions",
    "AllocateProducerIds",
];

pub fn api_key_name(api_key: i16) -> &'static str {
    usize::try_from(api_key)
        .ok()
        .and_then(|k| API_KEY_NAMES.get(k).copied())
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_names() {
        assert_eq!(api_key_name(0), "Produce");
        assert_eq!(api_key_name(1), "Fetch");
        assert_eq!(api_key_name(18), "ApiVersions");
        assert_eq!(api_key_name(67), "AllocateProducerIds");
        assert_eq!(api_key_name(68), "Unknown");
        assert_eq!(api_key_name(-1), "Unknown");
    }
}
