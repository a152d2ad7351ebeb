//! Per-hardware-family command packet encoders.
//!
//! Every packet starts with a header dword `opcode << 16 | body_dwords`, followed by
//! `body_dwords` little-endian dwords. Families differ in opcodes, in the extra post-sync dword
//! Gen12LP appends to tag stores and in heap alignment. The exact bit layout is private to this
//! crate; the only consumers are the submission backends and [`decode_packets`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareFamily {
    Gen9,
    Gen11,
    Gen12Lp,
}

/// Opcodes and sizes of one family's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub dispatch: u16,
    pub copy: u16,
    pub fill: u16,
    pub store_tag: u16,
    pub batch_start: u16,
    pub batch_end: u16,
    /// Extra zero dwords appended to the tag-store body.
    pub store_tag_post_sync_dwords: usize,
    pub heap_alignment: usize,
}

const GEN9_LAYOUT: PacketLayout = PacketLayout {
    dispatch: 0x7100,
    copy: 0x5040,
    fill: 0x5041,
    store_tag: 0x1020,
    batch_start: 0x0310,
    batch_end: 0x0050,
    store_tag_post_sync_dwords: 0,
    heap_alignment: 64,
};

const GEN11_LAYOUT: PacketLayout = PacketLayout {
    dispatch: 0x7110,
    copy: 0x5042,
    fill: 0x5043,
    store_tag: 0x1021,
    batch_start: 0x0311,
    batch_end: 0x0050,
    store_tag_post_sync_dwords: 0,
    heap_alignment: 64,
};

const GEN12LP_LAYOUT: PacketLayout = PacketLayout {
    dispatch: 0x7120,
    copy: 0x5044,
    fill: 0x5045,
    store_tag: 0x1022,
    batch_start: 0x0312,
    batch_end: 0x0050,
    store_tag_post_sync_dwords: 1,
    heap_alignment: 128,
};

/// Heap base addresses programmed ahead of a dispatch, indexed by
/// [`HeapKind::index`](crate::stream::HeapKind::index).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBases(pub [u64; 4]);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Dispatch { heaps: HeapBases, payload: Vec<u8> },
    Copy { src: u64, dst: u64, size: u64 },
    Fill { dst: u64, size: u64, pattern: Vec<u8> },
    StoreTag { address: u64, value: u32 },
    BatchStart { address: u64 },
    BatchEnd,
    Unknown { opcode: u16 },
}

const HEADER_BYTES: usize = 4;

/// Largest body a packet header can describe.
pub const MAX_PACKET_BODY_DWORDS: usize = 0xFFFF;

/// Largest kernel payload one dispatch packet can carry, after its heap bases and length dword.
pub const MAX_DISPATCH_PAYLOAD_BYTES: usize = (MAX_PACKET_BODY_DWORDS - 9) * 4;

/// Largest pattern one fill packet can carry.
pub const MAX_FILL_PATTERN_BYTES: usize = (MAX_PACKET_BODY_DWORDS - 5) * 4;

fn padded_dwords(len: usize) -> usize {
    len.div_ceil(4)
}

fn push_header(out: &mut Vec<u8>, opcode: u16, body_dwords: usize) {
    debug_assert!(body_dwords <= MAX_PACKET_BODY_DWORDS, "packet body too long");
    let header = (u32::from(opcode) << 16) | (body_dwords as u32 & 0xFFFF);
    out.extend_from_slice(&header.to_le_bytes());
}

fn push_dword(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_qword(out: &mut Vec<u8>, value: u64) {
    push_dword(out, value as u32);
    push_dword(out, (value >> 32) as u32);
}

fn push_padded(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
    out.resize(out.len() + padded_dwords(bytes.len()) * 4 - bytes.len(), 0);
}

/// Capability interface implemented once per hardware family.
///
/// Implementors only pick a [`PacketLayout`]; encoding is shared.
pub trait CommandEncoder: Send + Sync + fmt::Debug {
    fn family(&self) -> HardwareFamily;

    fn layout(&self) -> &'static PacketLayout;

    fn heap_alignment(&self) -> usize {
        self.layout().heap_alignment
    }

    fn dispatch_size(&self, payload_len: usize) -> usize {
        HEADER_BYTES + (8 + 1 + padded_dwords(payload_len)) * 4
    }

    fn encode_dispatch(&self, out: &mut Vec<u8>, heaps: &HeapBases, payload: &[u8]) {
        push_header(out, self.layout().dispatch, 9 + padded_dwords(payload.len()));
        for base in heaps.0 {
            push_qword(out, base);
        }
        push_dword(out, payload.len() as u32);
        push_padded(out, payload);
    }

    fn copy_size(&self) -> usize {
        HEADER_BYTES + 6 * 4
    }

    fn encode_copy(&self, out: &mut Vec<u8>, src: u64, dst: u64, size: u64) {
        push_header(out, self.layout().copy, 6);
        push_qword(out, src);
        push_qword(out, dst);
        push_qword(out, size);
    }

    fn fill_size(&self, pattern_len: usize) -> usize {
        HEADER_BYTES + (5 + padded_dwords(pattern_len)) * 4
    }

    fn encode_fill(&self, out: &mut Vec<u8>, dst: u64, size: u64, pattern: &[u8]) {
        push_header(out, self.layout().fill, 5 + padded_dwords(pattern.len()));
        push_qword(out, dst);
        push_qword(out, size);
        push_dword(out, pattern.len() as u32);
        push_padded(out, pattern);
    }

    fn store_tag_size(&self) -> usize {
        HEADER_BYTES + (3 + self.layout().store_tag_post_sync_dwords) * 4
    }

    fn encode_store_tag(&self, out: &mut Vec<u8>, tag_address: u64, value: u32) {
        let post_sync = self.layout().store_tag_post_sync_dwords;
        push_header(out, self.layout().store_tag, 3 + post_sync);
        push_qword(out, tag_address);
        push_dword(out, value);
        for _ in 0..post_sync {
            push_dword(out, 0);
        }
    }

    fn batch_start_size(&self) -> usize {
        HEADER_BYTES + 2 * 4
    }

    fn encode_batch_start(&self, out: &mut Vec<u8>, address: u64) {
        push_header(out, self.layout().batch_start, 2);
        push_qword(out, address);
    }

    fn batch_end_size(&self) -> usize {
        HEADER_BYTES
    }

    fn encode_batch_end(&self, out: &mut Vec<u8>) {
        push_header(out, self.layout().batch_end, 0);
    }
}

#[derive(Debug, Default)]
pub struct Gen9Encoder;

impl CommandEncoder for Gen9Encoder {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Gen9
    }

    fn layout(&self) -> &'static PacketLayout {
        &GEN9_LAYOUT
    }
}

#[derive(Debug, Default)]
pub struct Gen11Encoder;

impl CommandEncoder for Gen11Encoder {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Gen11
    }

    fn layout(&self) -> &'static PacketLayout {
        &GEN11_LAYOUT
    }
}

#[derive(Debug, Default)]
pub struct Gen12LpEncoder;

impl CommandEncoder for Gen12LpEncoder {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Gen12Lp
    }

    fn layout(&self) -> &'static PacketLayout {
        &GEN12LP_LAYOUT
    }
}

pub fn encoder_for(family: HardwareFamily) -> Arc<dyn CommandEncoder> {
    match family {
        HardwareFamily::Gen9 => Arc::new(Gen9Encoder),
        HardwareFamily::Gen11 => Arc::new(Gen11Encoder),
        HardwareFamily::Gen12Lp => Arc::new(Gen12LpEncoder),
    }
}

struct DwordReader<'a> {
    bytes: &'a [u8],
}

impl<'a> DwordReader<'a> {
    fn dword(&mut self) -> Option<u32> {
        let (head, rest) = self.bytes.split_first_chunk::<4>()?;
        self.bytes = rest;
        Some(u32::from_le_bytes(*head))
    }

    fn qword(&mut self) -> Option<u64> {
        let lo = self.dword()?;
        let hi = self.dword()?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }

    fn bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let padded = padded_dwords(len) * 4;
        if self.bytes.len() < padded {
            return None;
        }
        let (head, rest) = self.bytes.split_at(padded);
        self.bytes = rest;
        Some(head[..len].to_vec())
    }
}

/// Decode a packet stream produced by an encoder with `layout`.
///
/// Decoding stops at the first truncated packet. Opcodes the layout does not know are reported as
/// [`Packet::Unknown`] and skipped using the header's body length.
pub fn decode_packets(layout: &PacketLayout, bytes: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut reader = DwordReader { bytes };

    while let Some(header) = reader.dword() {
        let opcode = (header >> 16) as u16;
        let body_dwords = (header & 0xFFFF) as usize;
        if reader.bytes.len() < body_dwords * 4 {
            break;
        }
        let (body, rest) = reader.bytes.split_at(body_dwords * 4);
        reader.bytes = rest;
        let mut body = DwordReader { bytes: body };

        let packet = if opcode == layout.dispatch {
            decode_dispatch(&mut body)
        } else if opcode == layout.copy {
            decode_copy(&mut body)
        } else if opcode == layout.fill {
            decode_fill(&mut body)
        } else if opcode == layout.store_tag {
            decode_store_tag(&mut body)
        } else if opcode == layout.batch_start {
            body.qword().map(|address| Packet::BatchStart { address })
        } else if opcode == layout.batch_end {
            Some(Packet::BatchEnd)
        } else {
            Some(Packet::Unknown { opcode })
        };

        match packet {
            Some(p) => packets.push(p),
            None => break,
        }
    }
    packets
}

fn decode_copy(body: &mut DwordReader<'_>) -> Option<Packet> {
    Some(Packet::Copy {
        src: body.qword()?,
        dst: body.qword()?,
        size: body.qword()?,
    })
}

fn decode_fill(body: &mut DwordReader<'_>) -> Option<Packet> {
    let dst = body.qword()?;
    let size = body.qword()?;
    let len = body.dword()? as usize;
    Some(Packet::Fill {
        dst,
        size,
        pattern: body.bytes(len)?,
    })
}

fn decode_store_tag(body: &mut DwordReader<'_>) -> Option<Packet> {
    Some(Packet::StoreTag {
        address: body.qword()?,
        value: body.dword()?,
    })
}

fn decode_dispatch(body: &mut DwordReader<'_>) -> Option<Packet> {
    let mut heaps = HeapBases::default();
    for base in heaps.0.iter_mut() {
        *base = body.qword()?;
    }
    let len = body.dword()? as usize;
    Some(Packet::Dispatch {
        heaps,
        payload: body.bytes(len)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn sizes_match_encoded_lengths() {
        for family in [
            HardwareFamily::Gen9,
            HardwareFamily::Gen11,
            HardwareFamily::Gen12Lp,
        ] {
            let enc = encoder_for(family);
            assert_eq!(enc.family(), family);

            let mut out = Vec::new();
            enc.encode_dispatch(&mut out, &HeapBases::default(), &[1, 2, 3, 4, 5]);
            assert_eq!(out.len(), enc.dispatch_size(5));

            out.clear();
            enc.encode_store_tag(&mut out, 0x1000, 1);
            assert_eq!(out.len(), enc.store_tag_size());

            out.clear();
            enc.encode_fill(&mut out, 0, 16, &[0xAA, 0xBB]);
            assert_eq!(out.len(), enc.fill_size(2));

            out.clear();
            enc.encode_copy(&mut out, 0, 0, 0);
            enc.encode_batch_start(&mut out, 0);
            enc.encode_batch_end(&mut out);
            assert_eq!(
                out.len(),
                enc.copy_size() + enc.batch_start_size() + enc.batch_end_size()
            );
        }
    }

    #[test]
    fn largest_dispatch_still_decodes() {
        let enc = Gen9Encoder;
        let payload = vec![0x5A; MAX_DISPATCH_PAYLOAD_BYTES];
        let mut out = Vec::new();
        enc.encode_dispatch(&mut out, &HeapBases::default(), &payload);
        enc.encode_batch_end(&mut out);
        assert_eq!(out.len(), enc.dispatch_size(payload.len()) + enc.batch_end_size());

        let packets = decode_packets(enc.layout(), &out);
        assert_eq!(packets.len(), 2);
        assert!(matches!(
            &packets[0],
            Packet::Dispatch { payload: decoded, .. } if decoded.len() == payload.len()
        ));
        assert_eq!(packets[1], Packet::BatchEnd);
    }

    #[test]
    fn gen12_tag_store_carries_post_sync_dword() {
        let mut gen9 = Vec::new();
        let mut gen12 = Vec::new();
        Gen9Encoder.encode_store_tag(&mut gen9, 0, 0);
        Gen12LpEncoder.encode_store_tag(&mut gen12, 0, 0);
        assert_eq!(gen12.len(), gen9.len() + 4);
        assert!(Gen12LpEncoder.heap_alignment() > Gen9Encoder.heap_alignment());
    }

    #[test]
    fn decoded_stream_matches_what_was_encoded() {
        let enc = Gen11Encoder;
        let heaps = HeapBases([0x10, 0x20, 0x30, 0x40]);
        let mut out = Vec::new();
        enc.encode_dispatch(&mut out, &heaps, b"kernel");
        enc.encode_fill(&mut out, 0x1_0000, 64, &[7, 8, 9]);
        enc.encode_store_tag(&mut out, 0xdead_0000, 42);
        enc.encode_batch_end(&mut out);

        assert_eq!(
            decode_packets(enc.layout(), &out),
            vec![
                Packet::Dispatch {
                    heaps,
                    payload: b"kernel".to_vec()
                },
                Packet::Fill {
                    dst: 0x1_0000,
                    size: 64,
                    pattern: vec![7, 8, 9]
                },
                Packet::StoreTag {
                    address: 0xdead_0000,
                    value: 42
                },
                Packet::BatchEnd,
            ]
        );
    }

    #[test]
    fn truncated_stream_stops_decoding() {
        let mut out = Vec::new();
        Gen9Encoder.encode_copy(&mut out, 1, 2, 3);
        out.truncate(out.len() - 1);
        assert!(decode_packets(Gen9Encoder.layout(), &out).is_empty());
    }
}
