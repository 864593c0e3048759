// src/packet/mod.rs
//
// Payload classification and typed decoding.
// A payload is classified once from its header bytes, then decoded into a
// `Packet` variant whose optional fields are plain `Option`s.

pub mod app;
pub mod pal;

use serde::Serialize;

use crate::checksums::crc8_twelite_checksum;
use crate::error::ClassifyError;

pub use app::{decode_volt, AppIo, AppTag, AppTwelite, AppUart};
pub use pal::{
    Accel, AccelSample, MagState, PalAmb, PalAria, PalBoard, PalCue, PalData, PalDataInfo,
    PalDataType, PalEvent, PalMag, PalMot, PalPacket, SensorBlock,
};

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketKind {
    Error,
    Twelite,
    Pal,
    AppIo,
    AppUart,
    AppTag,
    ActStd,
}

impl PacketKind {
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Error => "ERROR",
            PacketKind::Twelite => "TWELITE",
            PacketKind::Pal => "PAL",
            PacketKind::AppIo => "APPIO",
            PacketKind::AppUart => "APPUART",
            PacketKind::AppTag => "APPTAG",
            PacketKind::ActStd => "ACT_STD",
        }
    }
}

/// Walk the PAL sensor blocks from offset 15. Returns the CRC offset when every
/// block fits and a CRC byte follows.
fn pal_crc_offset(p: &[u8]) -> Option<usize> {
    let count = p[14];
    let mut pos = 15usize;
    for _ in 0..count {
        if p.len() <= pos + 4 {
            return None;
        }
        let len = p[pos + 3] as usize;
        pos += 4;
        if p.len() <= pos + len {
            return None;
        }
        pos += len;
    }
    (pos < p.len()).then_some(pos)
}

fn is_pal(p: &[u8]) -> bool {
    if !(p.len() > 14 && p[0] & 0x80 != 0 && p[7] & 0x80 != 0 && p[12] == 0x80) {
        return false;
    }
    match pal_crc_offset(p) {
        Some(crc_pos) => crc8_twelite_checksum(&p[..crc_pos]) == p[crc_pos],
        None => false,
    }
}

fn is_uart_like(p: &[u8], command: u8) -> bool {
    p.len() > 13
        && p[1] == command
        && p[3] & 0x80 != 0
        && (p[12] as usize) * 256 + p[13] as usize == p.len() - 14
}

/// Classify a framed payload from its fixed header bytes and length.
/// Rules are evaluated in order; the first match wins.
pub fn identify_packet_type(p: &[u8]) -> PacketKind {
    if is_pal(p) {
        return PacketKind::Pal;
    }
    if p.len() == 23 && p[1] == 0x81 && p[3] == 0x01 && p[5] & 0x80 != 0 {
        return PacketKind::Twelite;
    }
    if p.len() == 20 && p[1] == 0x81 && p[3] == 0x02 && p[5] & 0x80 != 0 {
        return PacketKind::AppIo;
    }
    if is_uart_like(p, 0xA0) {
        return PacketKind::AppUart;
    }
    if is_uart_like(p, 0xAA) {
        return PacketKind::ActStd;
    }
    if p.len() > 14 && p[0] & 0x80 != 0 && p[7] & 0x80 != 0 && p[12] != 0x80 {
        return PacketKind::AppTag;
    }
    PacketKind::Error
}

// ============================================================================
// Decoded packets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    Pal(PalPacket),
    Twelite(AppTwelite),
    AppIo(AppIo),
    AppUart(AppUart),
    ActStd(AppUart),
    AppTag(AppTag),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Pal(_) => PacketKind::Pal,
            Packet::Twelite(_) => PacketKind::Twelite,
            Packet::AppIo(_) => PacketKind::AppIo,
            Packet::AppUart(_) => PacketKind::AppUart,
            Packet::ActStd(_) => PacketKind::ActStd,
            Packet::AppTag(_) => PacketKind::AppTag,
        }
    }

    /// 32-bit serial id of the sending module.
    pub fn src_addr(&self) -> u32 {
        match self {
            Packet::Pal(p) => p.src_addr,
            Packet::Twelite(p) => p.src_addr,
            Packet::AppIo(p) => p.src_addr,
            Packet::AppUart(p) | Packet::ActStd(p) => p.src_addr,
            Packet::AppTag(p) => p.src_addr,
        }
    }

    pub fn lqi(&self) -> u8 {
        match self {
            Packet::Pal(p) => p.lqi,
            Packet::Twelite(p) => p.lqi,
            Packet::AppIo(p) => p.lqi,
            Packet::AppUart(p) | Packet::ActStd(p) => p.lqi,
            Packet::AppTag(p) => p.lqi,
        }
    }
}

/// Classify and decode a payload in one pass.
pub fn decode(payload: &[u8]) -> Result<Packet, ClassifyError> {
    match identify_packet_type(payload) {
        PacketKind::Pal => PalPacket::parse(payload).map(Packet::Pal),
        PacketKind::Twelite => AppTwelite::parse(payload).map(Packet::Twelite),
        PacketKind::AppIo => AppIo::parse(payload).map(Packet::AppIo),
        PacketKind::AppUart => AppUart::parse(payload, "APPUART").map(Packet::AppUart),
        PacketKind::ActStd => AppUart::parse(payload, "ACT_STD").map(Packet::ActStd),
        PacketKind::AppTag => AppTag::parse(payload).map(Packet::AppTag),
        PacketKind::Error => Err(ClassifyError::Unrecognized { len: payload.len() }),
    }
}

// ============================================================================
// Big-endian reader
// ============================================================================

/// Sequential big-endian reader over a payload slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8], kind: &'static str) -> Self {
        ByteReader { data, pos: 0, kind }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClassifyError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ClassifyError::Truncated {
                kind: self.kind,
                need: end,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ClassifyError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ClassifyError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ClassifyError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], ClassifyError> {
        self.take(n)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        slice
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Payload of a captured frame with its LRC byte stripped.
    pub(crate) fn payload(line: &str) -> Vec<u8> {
        let mut bytes = hex::decode(line.trim_start_matches(':')).unwrap();
        bytes.pop();
        bytes
    }

    pub(crate) const MAG_LINE: &str =
        ":800000008D0011810EE29A01808103113008020CE411300102048A00000001006163";
    pub(crate) const MOT_LINE: &str = ":80000000A8002F810EE29A07808302113008020CE41130010203CC3014";
    pub(crate) const TWELITE_LINE: &str = ":7881150175810000380026C9000C04220000FFFFFFFFFFA7";
    pub(crate) const APPIO_LINE: &str = ":78811202848201015A003FC9000001000100010086";
    pub(crate) const APPTAG_LINE: &str = ":80000000B10001810043C10032C9047C02AF0A41D2";
    pub(crate) const ACT_LINE: &str =
        ":FEAA008201015A00000000B7000F424154310F0CEE000B03FF03FF03FF92";

    #[test]
    fn test_identify_captured_payloads() {
        assert_eq!(identify_packet_type(&payload(MAG_LINE)), PacketKind::Pal);
        assert_eq!(identify_packet_type(&payload(MOT_LINE)), PacketKind::Pal);
        assert_eq!(identify_packet_type(&payload(TWELITE_LINE)), PacketKind::Twelite);
        assert_eq!(identify_packet_type(&payload(APPIO_LINE)), PacketKind::AppIo);
        assert_eq!(identify_packet_type(&payload(APPTAG_LINE)), PacketKind::AppTag);
        assert_eq!(identify_packet_type(&payload(ACT_LINE)), PacketKind::ActStd);

        let uart = hex::decode("78A01286300001FFFFFFFFD80003123456").unwrap();
        assert_eq!(identify_packet_type(&uart), PacketKind::AppUart);
    }

    #[test]
    fn test_pal_with_bad_crc_is_not_pal() {
        let mut p = payload(MAG_LINE);
        let last = p.len() - 1;
        p[last] ^= 0x01;
        // Header still looks like a PAL/TAG frame, but p[12] == 0x80 rules out TAG too
        assert_eq!(identify_packet_type(&p), PacketKind::Error);
    }

    #[test]
    fn test_pal_block_overrunning_payload_is_rejected() {
        let mut p = payload(MAG_LINE);
        p.truncate(p.len() - 2);
        assert_eq!(identify_packet_type(&p), PacketKind::Error);
    }

    #[test]
    fn test_short_and_empty_payloads() {
        assert_eq!(identify_packet_type(&[]), PacketKind::Error);
        assert_eq!(identify_packet_type(&[0x80; 10]), PacketKind::Error);
        assert!(matches!(
            decode(&[0x01, 0x02]),
            Err(ClassifyError::Unrecognized { len: 2 })
        ));
    }

    #[test]
    fn test_decode_reports_common_fields() {
        let packet = decode(&payload(TWELITE_LINE)).unwrap();
        assert_eq!(packet.kind(), PacketKind::Twelite);
        assert_eq!(packet.src_addr(), 0x8100_0038);
        assert_eq!(packet.lqi(), 0x75);

        let packet = decode(&payload(MAG_LINE)).unwrap();
        assert_eq!(packet.src_addr(), 0x810E_E29A);
        assert_eq!(packet.lqi(), 0x8D);
        assert_eq!(packet.kind().name(), "PAL");
    }

    #[test]
    fn test_byte_reader_truncation() {
        let mut r = ByteReader::new(&[0x12, 0x34, 0x56], "test");
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert!(matches!(
            r.u16(),
            Err(ClassifyError::Truncated { need: 4, got: 3, .. })
        ));
        assert_eq!(r.u8().unwrap(), 0x56);
        assert!(r.rest().is_empty());
    }
}
