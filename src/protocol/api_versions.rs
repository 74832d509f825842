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

use super::decoder::Decoder;
use super::Result;

/// The classic ApiVersions body carries no fields; newer flexible versions
/// add client software metadata which is of no interest to the observer.
#[derive(Debug, Default, Serialize)]
pub struct ApiVersionsRequest {}

impl ApiVersionsRequest {
    pub fn decode(_pd: &mut Decoder, _version: i16) -> Result<ApiVersionsRequest> {
        Ok(ApiVersionsRequest {})
    }
}
