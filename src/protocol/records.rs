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
use super::message_set::MessageSet;
use super::record_batch::RecordBatch;
use super::Result;

// The magic byte sits at the same offset in both container formats:
// legacy (offset 8) + size (4) + crc (4), v2 first offset (8) + batch
// length (4) + leader epoch (4).
const MAGIC_OFFSET: usize = 16;

/// Container union inside a produce partition, discriminated by the magic
/// byte: < 2 is a legacy message set, >= 2 a record batch.
#[derive(Debug, Serialize)]
pub enum Records {
    Legacy(MessageSet),
    Default(RecordBatch),
}

impl Records {
    pub fn decode(pd: &mut Decoder) -> Result<Records> {
        let magic = pd.peek_int8(MAGIC_OFFSET)?;
        if magic < 2 {
            Ok(Records::Legacy(MessageSet::decode(pd)?))
        } else {
            Ok(Records::Default(RecordBatch::decode(pd)?))
        }
    }
}
