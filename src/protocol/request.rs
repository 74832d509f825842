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

use std::io::{self, Read};

use serde::Serialize;

use super::api_versions::ApiVersionsRequest;
use super::decoder::Decoder;
use super::fetch::FetchRequest;
use super::list_groups::ListGroupsRequest;
use super::metadata::MetadataRequest;
use super::produce::ProduceRequest;
use super::{
    api_key_name, Error, Result, API_KEY_API_VERSIONS, API_KEY_FETCH, API_KEY_LIST_GROUPS,
    API_KEY_METADATA, API_KEY_PRODUCE,
};

pub const MAX_REQUEST_SIZE: i32 = 100 * 1024 * 1024;

/// Body of a request whose key or version the observer does not decode;
/// only the envelope fields are recorded.
#[derive(Debug, Serialize)]
pub struct OpaqueRequest {
    pub api_key: i16,
}

#[derive(Debug, Serialize)]
pub enum RequestBody {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    Metadata(MetadataRequest),
    ListGroups(ListGroupsRequest),
    ApiVersions(ApiVersionsRequest),
    Other(OpaqueRequest),
}

impl RequestBody {
    /// Stable tag used as part of the client-stat key and for filtering.
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestBody::Produce(_) => "Produce",
            RequestBody::Fetch(_) => "Fetch",
            RequestBody::Metadata(_) => "Metadata",
            RequestBody::ListGroups(_) => "ListGroups",
            RequestBody::ApiVersions(_) => "ApiVersions",
            RequestBody::Other(o) => api_key_name(o.api_key),
        }
    }

    pub fn extract_topics(&self) -> Vec<String> {
        match self {
            RequestBody::Produce(r) => r.extract_topics(),
            RequestBody::Fetch(r) => r.extract_topics(),
            RequestBody::Metadata(r) => r.extract_topics(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Request {
    /// Length of the frame remainder as recorded on the wire.
    pub size: i32,
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
    pub body: RequestBody,
}

/// Frames and decodes one request from a client byte stream.
///
/// On success returns the request and the bytes consumed (4 + frame length).
/// A clean end of input on the frame boundary is [Error::EndOfStream]; inside
/// a frame it is [Error::UnexpectedEndOfStream]. Malformed frames produce
/// [Error::PacketDecoding] carrying the bytes consumed so far so the caller
/// can resynchronize.
pub fn decode_request(r: &mut impl Read) -> Result<(Request, usize)> {
    let mut length_bytes = [0u8; 4];
    read_full(r, &mut length_bytes, true)?;
    let length = i32::from_be_bytes(length_bytes);
    if length <= 4 || length > MAX_REQUEST_SIZE {
        return Err(Error::PacketDecoding {
            message: format!("message of length {} too large or too small", length),
            consumed: length_bytes.len(),
        });
    }

    let mut frame = vec![0u8; length as usize];
    read_full(r, &mut frame, false)?;
    let consumed = length_bytes.len() + frame.len();

    match decode_frame(&frame, length) {
        Ok(req) => Ok((req, consumed)),
        Err(e) => Err(Error::PacketDecoding {
            message: e.to_string(),
            consumed,
        }),
    }
}

fn decode_frame(frame: &[u8], length: i32) -> Result<Request> {
    let mut pd = Decoder::new(frame);
    let api_key = pd.get_int16()?;
    let api_version = pd.get_int16()?;
    let correlation_id = pd.get_int32()?;
    let client_id = pd.get_string()?;

    // Flexible (compact) encodings are not decoded; those versions fall back
    // to an opaque body that still carries the api key's name.
    let body = match (api_key, api_version) {
        (API_KEY_PRODUCE, 0..=8) => {
            RequestBody::Produce(ProduceRequest::decode(&mut pd, api_version)?)
        }
        (API_KEY_FETCH, 0..=11) => RequestBody::Fetch(FetchRequest::decode(&mut pd, api_version)?),
        (API_KEY_METADATA, 0..=8) => {
            RequestBody::Metadata(MetadataRequest::decode(&mut pd, api_version)?)
        }
        (API_KEY_LIST_GROUPS, 0..=2) => {
            RequestBody::ListGroups(ListGroupsRequest::decode(&mut pd, api_version)?)
        }
        (API_KEY_API_VERSIONS, _) => {
            RequestBody::ApiVersions(ApiVersionsRequest::decode(&mut pd, api_version)?)
        }
        _ => RequestBody::Other(OpaqueRequest { api_key }),
    };

    Ok(Request {
        size: length,
        api_key,
        api_version,
        correlation_id,
        client_id,
        body,
    })
}

fn read_full(r: &mut impl Read, buf: &mut [u8], at_frame_boundary: bool) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                if at_frame_boundary && filled == 0 {
                    return Err(Error::EndOfStream);
                }
                return Err(Error::UnexpectedEndOfStream);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}
