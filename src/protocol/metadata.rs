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
pub struct MetadataRequest {
    /// None asks for all topics (null array on the wire).
    pub topics: Option<Vec<String>>,
    pub allow_auto_topic_creation: bool,
}

impl MetadataRequest {
    pub fn decode(pd: &mut Decoder, version: i16) -> Result<MetadataRequest> {
        let mut r = MetadataRequest::default();
        r.topics = match pd.get_array_length()? {
            None => None,
            Some(count) => {
                let mut topics = Vec::with_capacity(count);
                for _ in 0..count {
                    topics.push(
                        pd.get_string()?
                            .ok_or_else(|| Error::InvalidData("null topic name".into()))?,
                    );
                }
                Some(topics)
            }
        };
        if version >= 4 {
            r.allow_auto_topic_creation = pd.get_int8()? != 0;
        }
        Ok(r)
    }

    pub fn extract_topics(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.topics
            .iter()
            .flatten()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_topics_means_all() {
        let body = (-1i32).to_be_bytes();
        let mut pd = Decoder::new(&body);
        let req = MetadataRequest::decode(&mut pd, 0).unwrap();
        assert_eq!(req.topics, None);
        assert!(req.extract_topics().is_empty());
    }

    #[test]
    fn named_topics() {
        let mut body = 2i32.to_be_bytes().to_vec();
        for name in ["x", "y"] {
            body.extend_from_slice(&(name.len() as i16).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
        }
        body.push(1); // allow auto topic creation
        let mut pd = Decoder::new(&body);
        let req = MetadataRequest::decode(&mut pd, 4).unwrap();
        assert_eq!(req.extract_topics(), vec!["x", "y"]);
        assert!(req.allow_auto_topic_creation);
    }
}
