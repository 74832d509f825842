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

use super::compression::{decompress, CompressionCodec};
use super::crc_field::{acquire_crc32_field, CrcPolynomial};
use super::decoder::{Decoder, PushedField, VarintLengthField};
use super::{Error, Result};

// Bytes of the batch counted by batch_length ahead of the records payload:
// partition leader epoch through the record count.
const RECORD_BATCH_OVERHEAD: i32 = 49;

const CONTROL_MASK: i16 = 0x20;
const TRANSACTIONAL_MASK: i16 = 0x10;
const TIMESTAMP_TYPE_MASK: i16 = 0x08;

#[derive(Debug, Default, Serialize)]
pub struct RecordHeader {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Default, Serialize)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta_ms: i64,
    pub offset_delta: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    fn decode(pd: &mut Decoder) -> Result<Record> {
        let mut length = VarintLengthField::default();
        length.decode(pd)?;
        pd.push(PushedField::VarintLength(length))?;

        let mut r = Record {
            attributes: pd.get_int8()?,
            timestamp_delta_ms: pd.get_varint()?,
            offset_delta: pd.get_varint()?,
            key: pd.get_varint_bytes()?.map(<[u8]>::to_vec),
            value: pd.get_varint_bytes()?.map(<[u8]>::to_vec),
            headers: Vec::new(),
        };

        let header_count = pd.get_varint_array_length()?.unwrap_or(0);
        for _ in 0..header_count {
            r.headers.push(RecordHeader {
                key: pd.get_varint_bytes()?.map(<[u8]>::to_vec),
                value: pd.get_varint_bytes()?.map(<[u8]>::to_vec),
            });
        }

        pd.pop()?;
        Ok(r)
    }
}

/// v2 physical container of records; the region after the version byte is
/// guarded by a Castagnoli CRC.
#[derive(Debug, Default, Serialize)]
pub struct RecordBatch {
    pub first_offset: i64,
    pub partition_leader_epoch: i32,
    pub version: i8,
    pub codec: CompressionCodec,
    pub control: bool,
    pub log_append_time: bool,
    pub is_transactional: bool,
    pub last_offset_delta: i32,
    pub first_timestamp_ms: Option<i64>,
    pub max_timestamp_ms: Option<i64>,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub first_sequence: i32,
    pub records: Vec<Record>,
    /// Set when the broker truncated the batch at a fetch boundary; the
    /// records list is empty and no error is surfaced.
    pub partial_trailing_record: bool,
}

impl RecordBatch {
    pub fn decode(pd: &mut Decoder) -> Result<RecordBatch> {
        let mut b = RecordBatch {
            first_offset: pd.get_int64()?,
            ..Default::default()
        };

        let batch_len = pd.get_int32()?;
        b.partition_leader_epoch = pd.get_int32()?;
        b.version = pd.get_int8()?;

        pd.push(PushedField::Crc32(acquire_crc32_field(
            CrcPolynomial::Castagnoli,
        )))?;

        let attributes = pd.get_int16()?;
        b.codec = CompressionCodec::from_attributes(attributes)?;
        b.control = attributes & CONTROL_MASK == CONTROL_MASK;
        b.log_append_time = attributes & TIMESTAMP_TYPE_MASK == TIMESTAMP_TYPE_MASK;
        b.is_transactional = attributes & TRANSACTIONAL_MASK == TRANSACTIONAL_MASK;

        b.last_offset_delta = pd.get_int32()?;
        let ts = pd.get_int64()?;
        b.first_timestamp_ms = (ts != -1).then_some(ts);
        let ts = pd.get_int64()?;
        b.max_timestamp_ms = (ts != -1).then_some(ts);
        b.producer_id = pd.get_int64()?;
        b.producer_epoch = pd.get_int16()?;
        b.first_sequence = pd.get_int32()?;

        let num_records = pd.get_array_length()?.unwrap_or(0);

        let buf_size = batch_len - RECORD_BATCH_OVERHEAD;
        if buf_size < 0 {
            return Err(Error::InvalidData("record batch length too small".into()));
        }
        let rec_buffer = match pd.get_raw_bytes(buf_size as usize) {
            Ok(raw) => raw,
            Err(Error::InsufficientData) => {
                b.partial_trailing_record = true;
                return Ok(b);
            }
            Err(e) => return Err(e),
        };

        pd.pop()?;

        let inflated = decompress(b.codec, rec_buffer)?;
        let mut rpd = Decoder::new(&inflated);
        for _ in 0..num_records {
            match Record::decode(&mut rpd) {
                Ok(r) => b.records.push(r),
                Err(Error::InsufficientData) => {
                    b.partial_trailing_record = true;
                    b.records.clear();
                    return Ok(b);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(b)
    }
}
