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

use std::io::Read;

use serde::Serialize;

use super::{Error, Result};

// The lowest 3 bits of message / batch attributes select the codec.
pub const COMPRESSION_CODEC_MASK: i16 = 0x07;
// Bit 3 set for log-append-time timestamps.
pub const TIMESTAMP_TYPE_MASK: i16 = 0x08;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionCodec {
    pub fn from_attributes(attributes: i16) -> Result<Self> {
        match attributes & COMPRESSION_CODEC_MASK {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Gzip),
            2 => Ok(CompressionCodec::Snappy),
            3 => Ok(CompressionCodec::Lz4),
            4 => Ok(CompressionCodec::Zstd),
            other => Err(Error::InvalidData(
                format!("unknown compression codec {}", other).into(),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Zstd => "zstd",
        }
    }
}

/// Inflates a compressed record payload. A failure here aborts the containing
/// frame, not the connection.
pub fn decompress(codec: CompressionCodec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        CompressionCodec::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| decompress_error("gzip", e))?;
            Ok(out)
        }
        CompressionCodec::Snappy => decompress_snappy(data),
        CompressionCodec::Lz4 => {
            let mut out = Vec::new();
            lz4_flex::frame::FrameDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| decompress_error("lz4", e))?;
            Ok(out)
        }
        CompressionCodec::Zstd => {
            zstd::stream::decode_all(data).map_err(|e| decompress_error("zstd", e))
        }
    }
}

fn decompress_error(codec: &str, e: impl std::fmt::Display) -> Error {
    Error::InvalidData(format!("{} decompression failed: {}", codec, e).into())
}

// Snappy framing used by snappy-java, seen in legacy message sets.
const XERIAL_HEADER: [u8; 8] = [130, 83, 78, 65, 80, 80, 89, 0];
const XERIAL_HEADER_LEN: usize = 16;

fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    if !data.starts_with(&XERIAL_HEADER) {
        return snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| decompress_error("snappy", e));
    }
    if data.len() < XERIAL_HEADER_LEN {
        return Err(Error::InvalidData("truncated xerial snappy header".into()));
    }
    let mut out = Vec::new();
    let mut rest = &data[XERIAL_HEADER_LEN..];
    let mut decoder = snap::raw::Decoder::new();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::InvalidData("truncated xerial snappy chunk".into()));
        }
        let size = u32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        if rest.len() < size {
            return Err(Error::InvalidData("truncated xerial snappy chunk".into()));
        }
        let chunk = decoder
            .decompress_vec(&rest[..size])
            .map_err(|e| decompress_error("snappy", e))?;
        out.extend_from_slice(&chunk);
        rest = &rest[size..];
    }
    Ok(out)
}
