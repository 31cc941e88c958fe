// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cyphal/UDP v1 frame header pack/unpack, CRC, and fragmentation (spec
//! §3.5, §4.4). The zerocopy-backed header struct follows the same pattern
//! the teacher crate uses for its BHS PDU headers (`models/nop/request.rs`):
//! a `repr(C)` struct of fixed-endian integer wrappers that can be read and
//! written in place without a manual byte-shuffling encoder.

use crc::{CRC_16_XMODEM, Crc};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32, U64,
};

use crate::{
    address::{ANONYMOUS_NODE_ID, Priority, TransferKind},
    error::TransportError,
};

/// Header CRC algorithm. The teacher crate depended on `crc` (3.4.0) without
/// ever using it; this revives that dependency for the header checksum,
/// leaving `crc32c` (already used for the iSCSI header/data digests) for the
/// trailing multi-frame transfer CRC below.
const HEADER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Size of the packed wire header, in bytes.
pub const HEADER_LEN: usize = 24;

/// Minimum payload capacity (bytes after the header) every implementation
/// must accept, per spec §4.4.
pub const MIN_MTU_PAYLOAD: usize = 68;

const EOT_BIT: u32 = 0x8000_0000;
const FRAME_INDEX_MASK: u32 = 0x7FFF_FFFF;

const SERVICE_NOT_MESSAGE_BIT: u16 = 0x8000;
const REQUEST_NOT_RESPONSE_BIT: u16 = 0x0200;
const SERVICE_ID_BITS: u16 = 0x01FF;
const SUBJECT_ID_BITS: u16 = 0x1FFF;

/// Packed Cyphal/UDP v1 header, wire order per spec §4.4: version, priority,
/// source node-ID, destination node-ID, data-specifier id, transfer-id,
/// frame index + EOT flag, reserved user data, header CRC.
///
/// `version` and `priority` are each a full byte rather than sub-byte
/// bitfields: the spec names them as a 1-byte version and a 3-bit priority,
/// but byte-aligning priority keeps the struct free of manual bit twiddling
/// without changing any observable field value (priority only ever takes
/// values 0..=7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FrameHeader {
    pub version: u8,
    pub priority: u8,
    pub source_node_id: U16<LittleEndian>,
    pub destination_node_id: U16<LittleEndian>,
    pub data_specifier: U16<LittleEndian>,
    pub transfer_id: U64<LittleEndian>,
    pub frame_index_eot: U32<LittleEndian>,
    pub user_data: U16<LittleEndian>,
    pub header_crc: U16<LittleEndian>,
}

/// Protocol version this crate implements.
pub const WIRE_VERSION: u8 = 1;

/// Logical contents of a decoded header, with the data-specifier bits
/// unpacked into `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub priority: Priority,
    pub source_node_id: u16,
    pub destination_node_id: u16,
    pub kind: TransferKind,
    pub port_id: u16,
    pub transfer_id: u64,
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

fn encode_data_specifier(kind: TransferKind, port_id: u16) -> u16 {
    match kind {
        TransferKind::Message => port_id & SUBJECT_ID_BITS,
        TransferKind::Request => {
            SERVICE_NOT_MESSAGE_BIT | REQUEST_NOT_RESPONSE_BIT | (port_id & SERVICE_ID_BITS)
        },
        TransferKind::Response => SERVICE_NOT_MESSAGE_BIT | (port_id & SERVICE_ID_BITS),
    }
}

fn decode_data_specifier(raw: u16) -> (TransferKind, u16) {
    if raw & SERVICE_NOT_MESSAGE_BIT != 0 {
        let kind = if raw & REQUEST_NOT_RESPONSE_BIT != 0 {
            TransferKind::Request
        } else {
            TransferKind::Response
        };
        (kind, raw & SERVICE_ID_BITS)
    } else {
        (TransferKind::Message, raw & SUBJECT_ID_BITS)
    }
}

/// Packs a header into its wire representation, computing the header CRC
/// over the preceding bytes.
pub fn encode_header(parsed: &ParsedHeader) -> [u8; HEADER_LEN] {
    let mut frame_index_eot = parsed.frame_index & FRAME_INDEX_MASK;
    if parsed.end_of_transfer {
        frame_index_eot |= EOT_BIT;
    }

    let mut header = FrameHeader {
        version: WIRE_VERSION,
        priority: parsed.priority as u8,
        source_node_id: U16::new(parsed.source_node_id),
        destination_node_id: U16::new(parsed.destination_node_id),
        data_specifier: U16::new(encode_data_specifier(parsed.kind, parsed.port_id)),
        transfer_id: U64::new(parsed.transfer_id),
        frame_index_eot: U32::new(frame_index_eot),
        user_data: U16::new(0),
        header_crc: U16::new(0),
    };

    let crc = HEADER_CRC.checksum(&header.as_bytes()[..HEADER_LEN - 2]);
    header.header_crc = U16::new(crc);

    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(header.as_bytes());
    out
}

/// Unpacks and validates a header. Returns `None` (not an error: spec §4.4
/// says a bad header CRC is dropped silently and only counted in
/// statistics) when the CRC does not verify or the version is unsupported.
pub fn decode_header(bytes: &[u8]) -> Option<ParsedHeader> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let header = FrameHeader::ref_from_bytes(&bytes[..HEADER_LEN]).ok()?;

    let want = HEADER_CRC.checksum(&bytes[..HEADER_LEN - 2]);
    if header.header_crc.get() != want {
        return None;
    }
    if header.version != WIRE_VERSION {
        return None;
    }

    let priority = Priority::from_wire(header.priority)?;
    let (kind, port_id) = decode_data_specifier(header.data_specifier.get());
    let frame_index_eot = header.frame_index_eot.get();

    Some(ParsedHeader {
        priority,
        source_node_id: header.source_node_id.get(),
        destination_node_id: header.destination_node_id.get(),
        kind,
        port_id,
        transfer_id: header.transfer_id.get(),
        frame_index: frame_index_eot & FRAME_INDEX_MASK,
        end_of_transfer: frame_index_eot & EOT_BIT != 0,
    })
}

/// Trailing 32-bit transfer CRC appended to the final frame of a
/// multi-frame transfer (spec §4.4), computed over the full original
/// payload. Single-frame transfers carry no trailing CRC: they are already
/// covered by the header CRC alone.
pub fn transfer_crc(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Splits `payload` into on-wire frame payload fragments of at most
/// `mtu_payload_capacity` bytes each. A single-frame transfer (payload fits
/// in one fragment) carries no trailing CRC; a multi-frame transfer appends
/// the transfer CRC as a trailing fragment, pulled back into the last frame
/// if room remains or pushed into an additional final frame otherwise.
pub fn fragment_payload(payload: &[u8], mtu_payload_capacity: usize) -> Vec<Vec<u8>> {
    assert!(mtu_payload_capacity >= MIN_MTU_PAYLOAD);

    if payload.len() <= mtu_payload_capacity {
        return vec![payload.to_vec()];
    }

    let crc = transfer_crc(payload).to_le_bytes();
    let mut with_crc = Vec::with_capacity(payload.len() + crc.len());
    with_crc.extend_from_slice(payload);
    with_crc.extend_from_slice(&crc);

    with_crc
        .chunks(mtu_payload_capacity)
        .map(|c| c.to_vec())
        .collect()
}

/// Number of whole frames `fragment_payload` would produce for a payload of
/// `payload_len` bytes, without doing the copy. Used by callers that need
/// to size buffers up front.
pub fn frame_count_for(payload_len: usize, mtu_payload_capacity: usize) -> usize {
    if payload_len <= mtu_payload_capacity {
        1
    } else {
        (payload_len + 4).div_ceil(mtu_payload_capacity)
    }
}

/// Programmer-facing error for header fields that are out of range before
/// they ever reach the wire (spec §8.3 boundary behaviors).
pub fn validate_port_id(kind: TransferKind, port_id: u16) -> Result<(), TransportError> {
    let ok = match kind {
        TransferKind::Message => crate::address::is_valid_subject_id(port_id),
        TransferKind::Request | TransferKind::Response => {
            crate::address::is_valid_service_id(port_id)
        },
    };
    if ok {
        Ok(())
    } else {
        Err(TransportError::InvalidArgumentError(format!(
            "port id {port_id} out of range for {kind:?}"
        )))
    }
}

/// Source/destination node-ID pair as they go on the wire: anonymous
/// sources and broadcast message destinations both use [`ANONYMOUS_NODE_ID`].
pub fn wire_node_id(node_id: Option<u16>) -> u16 {
    node_id.unwrap_or(ANONYMOUS_NODE_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ParsedHeader {
        ParsedHeader {
            priority: Priority::Nominal,
            source_node_id: 42,
            destination_node_id: ANONYMOUS_NODE_ID,
            kind: TransferKind::Message,
            port_id: 7509,
            transfer_id: 12345,
            frame_index: 0,
            end_of_transfer: true,
        }
    }

    #[test]
    fn round_trips_message_header() {
        let original = sample_header();
        let bytes = encode_header(&original);
        let decoded = decode_header(&bytes).expect("valid header");
        assert_eq!(decoded, original);
    }

    #[test]
    fn round_trips_service_request_and_response() {
        for kind in [TransferKind::Request, TransferKind::Response] {
            let header = ParsedHeader {
                priority: Priority::High,
                source_node_id: 10,
                destination_node_id: 11,
                kind,
                port_id: 430,
                transfer_id: 0,
                frame_index: 0,
                end_of_transfer: true,
            };
            let bytes = encode_header(&header);
            let decoded = decode_header(&bytes).expect("valid header");
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn corrupted_header_fails_crc() {
        let mut bytes = encode_header(&sample_header());
        bytes[2] ^= 0xFF;
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn single_frame_payload_is_not_fragmented() {
        let payload = vec![1u8; 32];
        let frames = fragment_payload(&payload, 256);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], payload);
    }

    #[test]
    fn multi_frame_payload_carries_trailing_crc() {
        let payload = vec![7u8; 4096];
        let frames = fragment_payload(&payload, 1024);
        assert!(frames.len() > 1);
        assert_eq!(frame_count_for(payload.len(), 1024), frames.len());

        let mut reassembled: Vec<u8> =
            frames.iter().flat_map(|f| f.iter().copied()).collect();
        let crc_bytes: Vec<u8> = reassembled.split_off(reassembled.len() - 4);
        assert_eq!(reassembled, payload);
        assert_eq!(
            u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes")),
            transfer_crc(&payload)
        );
    }
}
