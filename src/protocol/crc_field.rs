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

use std::cell::RefCell;

use super::{Error, Result};

/// CRC variant guarding a sub-region. Legacy messages record an IEEE CRC32;
/// v2 record batches record a Castagnoli CRC32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcPolynomial {
    Ieee,
    Castagnoli,
}

/// A pushed CRC32 guard. The 4 recorded CRC bytes sit at the region start;
/// the checksum covers everything consumed between push and pop.
#[derive(Debug)]
pub struct Crc32Field {
    polynomial: CrcPolynomial,
    start_offset: usize,
}

impl Crc32Field {
    fn new(polynomial: CrcPolynomial) -> Self {
        Self {
            polynomial,
            start_offset: 0,
        }
    }

    pub fn reserve(&self) -> usize {
        4
    }

    pub fn save_offset(&mut self, off: usize) {
        self.start_offset = off;
    }

    pub fn check(&self, cur_offset: usize, buf: &[u8]) -> Result<()> {
        let recorded = u32::from_be_bytes(
            buf[self.start_offset..self.start_offset + 4]
                .try_into()
                .unwrap(),
        );
        let region = &buf[self.start_offset + 4..cur_offset];
        let computed = match self.polynomial {
            CrcPolynomial::Ieee => crc32fast::hash(region),
            CrcPolynomial::Castagnoli => crc32c::crc32c(region),
        };
        if computed != recorded {
            return Err(Error::CrcMismatch { recorded, computed });
        }
        Ok(())
    }
}

thread_local! {
    static POOL: RefCell<Vec<Box<Crc32Field>>> = const { RefCell::new(Vec::new()) };
}

pub fn acquire_crc32_field(polynomial: CrcPolynomial) -> Box<Crc32Field> {
    POOL.with(|pool| match pool.borrow_mut().pop() {
        Some(mut f) => {
            f.polynomial = polynomial;
            f
        }
        None => Box::new(Crc32Field::new(polynomial)),
    })
}

pub fn release_crc32_field(mut field: Box<Crc32Field>) {
    field.start_offset = 0;
    POOL.with(|pool| pool.borrow_mut().push(field));
}

#[cfg(test)]
mod tests {
    use super::super::decoder::{Decoder, PushedField};
    use super::*;

    fn region(polynomial: CrcPolynomial, payload: &[u8]) -> Vec<u8> {
        let crc = match polynomial {
            CrcPolynomial::Ieee => crc32fast::hash(payload),
            CrcPolynomial::Castagnoli => crc32c::crc32c(payload),
        };
        let mut buf = crc.to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn ieee_crc_verifies() {
        let buf = region(CrcPolynomial::Ieee, b"hello kafka");
        let mut d = Decoder::new(&buf);
        d.push(PushedField::Crc32(acquire_crc32_field(CrcPolynomial::Ieee)))
            .unwrap();
        d.get_raw_bytes(11).unwrap();
        d.pop().unwrap();
    }

    #[test]
    fn castagnoli_crc_verifies() {
        let buf = region(CrcPolynomial::Castagnoli, b"record batch body");
        let mut d = Decoder::new(&buf);
        d.push(PushedField::Crc32(acquire_crc32_field(
            CrcPolynomial::Castagnoli,
        )))
        .unwrap();
        d.get_raw_bytes(17).unwrap();
        d.pop().unwrap();
    }

    #[test]
    fn flipped_bit_fails() {
        let mut buf = region(CrcPolynomial::Ieee, b"hello kafka");
        buf[7] ^= 0x20;
        let mut d = Decoder::new(&buf);
        d.push(PushedField::Crc32(acquire_crc32_field(CrcPolynomial::Ieee)))
            .unwrap();
        d.get_raw_bytes(11).unwrap();
        assert!(matches!(d.pop(), Err(Error::CrcMismatch { .. })));
    }

    #[test]
    fn short_region_consumption_fails_crc() {
        let buf = region(CrcPolynomial::Ieee, b"hello kafka");
        let mut d = Decoder::new(&buf);
        d.push(PushedField::Crc32(acquire_crc32_field(CrcPolynomial::Ieee)))
            .unwrap();
        d.get_raw_bytes(10).unwrap();
        assert!(matches!(d.pop(), Err(Error::CrcMismatch { .. })));
    }

    #[test]
    fn nested_regions() {
        let inner = region(CrcPolynomial::Castagnoli, b"inner");
        let mut outer_payload = Vec::new();
        outer_payload.extend_from_slice(&inner);
        outer_payload.extend_from_slice(b"tail");
        let buf = region(CrcPolynomial::Ieee, &outer_payload);

        let mut d = Decoder::new(&buf);
        d.push(PushedField::Crc32(acquire_crc32_field(CrcPolynomial::Ieee)))
            .unwrap();
        d.push(PushedField::Crc32(acquire_crc32_field(
            CrcPolynomial::Castagnoli,
        )))
        .unwrap();
        d.get_raw_bytes(5).unwrap();
        d.pop().unwrap();
        d.get_raw_bytes(4).unwrap();
        d.pop().unwrap();
    }

    #[test]
    fn pool_reuse_resets_state() {
        let f = acquire_crc32_field(CrcPolynomial::Ieee);
        release_crc32_field(f);
        let f = acquire_crc32_field(CrcPolynomial::Castagnoli);
        assert_eq!(f.polynomial, CrcPolynomial::Castagnoli);
        assert_eq!(f.start_offset, 0);
        release_crc32_field(f);
    }
}
