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

use std::net::Ipv4Addr;
use std::time::SystemTime;

use pnet::packet::ethernet::EtherTypes;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::TcpFlags;

use super::FlowKey;
use crate::utils::bytes::{read_u16_be, read_u32_be};

const ETH_HEADER_SIZE: usize = 14;
const ETH_TYPE_OFFSET: usize = 12;
const VLAN_HEADER_SIZE: usize = 4;
const IPV4_MIN_HEADER_SIZE: usize = 20;
const TCP_MIN_HEADER_SIZE: usize = 20;

/// Offsets-resolved view over one captured Ethernet frame. Only IPv4/TCP
/// frames produce a view; anything else is unusable for the observer.
pub struct MetaPacket<'a> {
    pub flow: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
    pub timestamp: SystemTime,
}

impl<'a> MetaPacket<'a> {
    pub fn parse(frame: &'a [u8], timestamp: SystemTime) -> Option<MetaPacket<'a>> {
        if frame.len() < ETH_HEADER_SIZE {
            return None;
        }
        let mut l3_offset = ETH_HEADER_SIZE;
        let mut eth_type = read_u16_be(&frame[ETH_TYPE_OFFSET..]);
        if eth_type == EtherTypes::Vlan.0 {
            if frame.len() < ETH_HEADER_SIZE + VLAN_HEADER_SIZE {
                return None;
            }
            eth_type = read_u16_be(&frame[ETH_TYPE_OFFSET + VLAN_HEADER_SIZE..]);
            l3_offset += VLAN_HEADER_SIZE;
        }
        if eth_type != EtherTypes::Ipv4.0 {
            return None;
        }

        let l3 = &frame[l3_offset..];
        if l3.len() < IPV4_MIN_HEADER_SIZE || l3[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(l3[0] & 0x0f) * 4;
        let total_length = usize::from(read_u16_be(&l3[2..]));
        if ihl < IPV4_MIN_HEADER_SIZE || total_length < ihl || l3.len() < total_length {
            return None;
        }
        if l3[9] != IpNextHeaderProtocols::Tcp.0 {
            return None;
        }
        let src_ip = Ipv4Addr::from(read_u32_be(&l3[12..]));
        let dst_ip = Ipv4Addr::from(read_u32_be(&l3[16..]));

        // total_length bounds the payload; short Ethernet frames are padded
        let l4 = &l3[ihl..total_length];
        if l4.len() < TCP_MIN_HEADER_SIZE {
            return None;
        }
        let data_offset = usize::from(l4[12] >> 4) * 4;
        if data_offset < TCP_MIN_HEADER_SIZE || l4.len() < data_offset {
            return None;
        }
        let flags = u16::from(l4[13]);

        Some(MetaPacket {
            flow: FlowKey {
                src_ip,
                dst_ip,
                src_port: read_u16_be(l4),
                dst_port: read_u16_be(&l4[2..]),
            },
            seq: read_u32_be(&l4[4..]),
            syn: flags & TcpFlags::SYN != 0,
            fin: flags & TcpFlags::FIN != 0,
            rst: flags & TcpFlags::RST != 0,
            payload: &l4[data_offset..],
            timestamp,
        })
    }
}
