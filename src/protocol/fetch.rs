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
use super::{Error, Result};

#[derive(Debug, Default, Serialize)]
pub struct FetchPartition {
    pub partition: i32,
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub max_bytes: i32,
}

#[derive(Debug, Serialize)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Default, Serialize)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    pub session_id: i32,
    pub session_epoch: i32,
    pub topics: Vec<FetchTopic>,
    pub rack_id: Option<String>,
}

impl FetchRequest {
    pub fn decode(pd: &mut Decoder, version: i16) -> Result<FetchRequest> {
        let mut r = FetchRequest {
            replica_id: pd.get_int32()?,
            max_wait_ms: pd.get_int32()?,
            min_bytes: pd.get_int32()?,
            ..Default::default()
        };
        if version >= 3 {
            r.max_bytes = pd.get_int32()?;
        }
        if version >= 4 {
            r.isolation_level = pd.get_int8()?;
        }
        if version >= 7 {
            r.session_id = pd.get_int32()?;
            r.session_epoch = pd.get_int32()?;
        }

        let topic_count = pd.get_array_length()?.unwrap_or(0);
        for _ in 0..topic_count {
            let name = pd
                .get_string()?
                .ok_or_else(|| Error::InvalidData("null topic name".into()))?;
            let partition_count = pd.get_array_length()?.unwrap_or(0);
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let mut p = FetchPartition {
                    partition: pd.get_int32()?,
                    ..Default::default()
                };
                if version >= 9 {
                    p.current_leader_epoch = pd.get_int32()?;
                }
                p.fetch_offset = pd.get_int64()?;
                if version >= 5 {
                    p.log_start_offset = pd.get_int64()?;
                }
                p.max_bytes = pd.get_int32()?;
                partitions.push(p);
            }
            r.topics.push(FetchTopic { name, partitions });
        }

        if version >= 7 {
            // forgotten topics carry no payload of interest here
            let forgotten_count = pd.get_array_length()?.unwrap_or(0);
            for _ in 0..forgotten_count {
                pd.get_string()?;
                let partition_count = pd.get_array_length()?.unwrap_or(0);
                for _ in 0..partition_count {
                    pd.get_int32()?;
                }
            }
        }
        if version >= 11 {
            r.rack_id = pd.get_string()?;
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
