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

use std::collections::HashSet;

use serde::Serialize;

use super::decoder::Decoder;
use super::records::Records;
use super::{Error, Result};

#[derive(Debug, Serialize)]
pub struct PartitionRecords {
    pub partition: i32,
    pub records: Option<Records>,
}

#[derive(Debug, Serialize)]
pub struct ProduceTopic {
    pub name: String,
    pub partitions: Vec<PartitionRecords>,
}

#[derive(Debug, Default, Serialize)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub required_acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopic>,
}

impl ProduceRequest {
    pub fn decode(pd: &mut Decoder, version: i16) -> Result<ProduceRequest> {
        let mut r = ProduceRequest::default();
        if version >= 3 {
            r.transactional_id = pd.get_string()?;
        }
        r.required_acks = pd.get_int16()?;
        r.timeout_ms = pd.get_int32()?;

        let topic_count = pd.get_array_length()?.unwrap_or(0);
        for _ in 0..topic_count {
            let name = pd
                .get_string()?
                .ok_or_else(|| Error::InvalidData("null topic name".into()))?;
            let partition_count = pd.get_array_length()?.unwrap_or(0);
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let partition = pd.get_int32()?;
                let records = match pd.get_bytes()? {
                    None => None,
                    Some(blob) if blob.is_empty() => None,
                    Some(blob) => Some(Records::decode(&mut Decoder::new(blob))?),
                };
                partitions.push(PartitionRecords { partition, records });
            }
            r.topics.push(ProduceTopic { name, partitions });
        }
        Ok(r)
    }

    /// Topic names deduplicated in order of first appearance.
    pub fn extract_topics(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.topics
            .iter()
            .filter(|t| seen.insert(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::record_batch::tests::{encode_batch, encode_record};
    use super::super::compression::CompressionCodec;
    use super::*;

    pub(crate) fn encode_produce_body(topics: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1i16.to_be_bytes()); // acks
        out.extend_from_slice(&1500i32.to_be_bytes()); // timeout
        out.extend_from_slice(&(topics.len() as i32).to_be_bytes());
        for (name, blob) in topics {
            out.extend_from_slice(&(name.len() as i16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&1i32.to_be_bytes()); // one partition
            out.extend_from_slice(&0i32.to_be_bytes()); // partition id
            out.extend_from_slice(&(blob.len() as i32).to_be_bytes());
            out.extend_from_slice(blob);
        }
        out
    }

    #[test]
    fn v0_with_empty_records_blob() {
        let body = encode_produce_body(&[("orders", &[])]);
        let mut pd = Decoder::new(&body);
        let req = ProduceRequest::decode(&mut pd, 0).unwrap();
        assert_eq!(req.required_acks, 1);
        assert_eq!(req.timeout_ms, 1500);
        assert_eq!(req.extract_topics(), vec!["orders"]);
        assert!(req.topics[0].partitions[0].records.is_none());
    }

    #[test]
    fn records_blob_decodes() {
        let rec = encode_record(Some(b"k"), Some(b"v"));
        let blob = encode_batch(CompressionCodec::None, 1, &rec);
        let body = encode_produce_body(&[("orders", &blob)]);
        let mut pd = Decoder::new(&body);
        let req = ProduceRequest::decode(&mut pd, 0).unwrap();
        match req.topics[0].partitions[0].records.as_ref().unwrap() {
            Records::Default(batch) => assert_eq!(batch.records.len(), 1),
            Records::Legacy(_) => panic!("expected record batch"),
        }
    }

    #[test]
    fn transactional_id_read_for_v3() {
        let mut body = Vec::new();
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(b"txn");
        body.extend_from_slice(&encode_produce_body(&[("a", &[])]));
        let mut pd = Decoder::new(&body);
        let req = ProduceRequest::decode(&mut pd, 3).unwrap();
        assert_eq!(req.transactional_id.as_deref(), Some("txn"));
        assert_eq!(req.extract_topics(), vec!["a"]);
    }

    #[test]
    fn extract_topics_deduplicates_in_order() {
        let body = encode_produce_body(&[("b", &[]), ("a", &[]), ("b", &[])]);
        let mut pd = Decoder::new(&body);
        let req = ProduceRequest::decode(&mut pd, 0).unwrap();
        assert_eq!(req.extract_topics(), vec!["b", "a"]);
    }
}
