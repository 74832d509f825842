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

use serde::Serialize;

use super::compression::{
    decompress, CompressionCodec, COMPRESSION_CODEC_MASK, TIMESTAMP_TYPE_MASK,
};
use super::crc_field::{acquire_crc32_field, CrcPolynomial};
use super::decoder::{Decoder, PushedField};
use super::{Error, Result};

// A compressed value wraps a whole message set; one wrap is the practical
// depth, anything deeper is treated as hostile input.
pub const MAX_NESTING_DEPTH: usize = 4;

/// Pre-v2 message. A compressed value recursively holds a nested set.
#[derive(Debug, Default, Serialize)]
pub struct Message {
    pub codec: CompressionCodec,
    pub log_append_time: bool,
    pub version: i8,
    /// Milliseconds since epoch, version 1 only; -1 on the wire means unset.
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub set: Option<Box<MessageSet>>,
}

impl Message {
    fn decode(pd: &mut Decoder, depth: usize) -> Result<Message> {
        let mut m = Message::default();
        pd.push(PushedField::Crc32(acquire_crc32_field(CrcPolynomial::Ieee)))?;

        m.version = pd.get_int8()?;
        if m.version > 1 {
            return Err(Error::InvalidData(
                format!("unknown magic byte ({})", m.version).into(),
            ));
        }

        let attributes = i16::from(pd.get_int8()?);
        m.codec = CompressionCodec::from_attributes(attributes & COMPRESSION_CODEC_MASK)?;
        m.log_append_time = attributes & TIMESTAMP_TYPE_MASK == TIMESTAMP_TYPE_MASK;

        if m.version == 1 {
            let ts = pd.get_int64()?;
            m.timestamp_ms = (ts != -1).then_some(ts);
        }

        m.key = pd.get_bytes()?.map(<[u8]>::to_vec);
        m.value = pd.get_bytes()?.map(<[u8]>::to_vec);

        if m.codec != CompressionCodec::None {
            if let Some(value) = &m.value {
                let inflated = decompress(m.codec, value)?;
                m.set = Some(Box::new(MessageSet::decode_nested(&inflated, depth + 1)?));
                m.value = Some(inflated);
            }
        }

        pd.pop()?;
        Ok(m)
    }
}

#[derive(Debug, Serialize)]
pub struct MessageBlock {
    pub offset: i64,
    pub msg: Message,
}

/// Legacy container: a concatenation of (offset, size, message) entries with
/// no leading count. A truncated trailing entry is not an error.
#[derive(Debug, Default, Serialize)]
pub struct MessageSet {
    pub messages: Vec<MessageBlock>,
    pub partial_trailing_message: bool,
}

impl MessageSet {
    pub fn decode(pd: &mut Decoder) -> Result<MessageSet> {
        Self::decode_with_depth(pd, 0)
    }

    fn decode_nested(raw: &[u8], depth: usize) -> Result<MessageSet> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::InvalidData("message set nested too deeply".into()));
        }
        let mut pd = Decoder::new(raw);
        Self::decode_with_depth(&mut pd, depth)
    }

    fn decode_with_depth(pd: &mut Decoder, depth: usize) -> Result<MessageSet> {
        let mut set = MessageSet::default();
        while pd.remaining() > 0 {
            if pd.remaining() < 12 {
                set.partial_trailing_message = true;
                break;
            }
            let offset = pd.get_int64()?;
            let size = pd.get_int32()?;
            if size < 0 {
                return Err(Error::InvalidData("negative message size".into()));
            }
            if pd.remaining() < size as usize {
                set.partial_trailing_message = true;
                break;
            }
            let raw = pd.get_raw_bytes(size as usize)?;
            let mut mpd = Decoder::new(raw);
            let msg = Message::decode(&mut mpd, depth)?;
            set.messages.push(MessageBlock { offset, msg });
        }
        Ok(set)
    }
}
