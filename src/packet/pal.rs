// src/packet/pal.rs
//
// TWELITE PAL payloads (MAG, AMB, MOT, NOTICE, CUE, ARIA boards).
//
// Layout after the 15-byte header is a list of sensor blocks:
//   [dt, ds, ex, ln] + ln data bytes
// dt bit 7 marks an error block, dt & 3 selects the element width (u8/u16/u32,
// big-endian). ds is the sensor code, ex an extension byte (channel, sample
// index, ...). A CRC-8 byte closes the payload.

use serde::Serialize;

use super::ByteReader;
use crate::error::ClassifyError;

// ============================================================================
// Sensor codes
// ============================================================================

const SNS_HALL: u8 = 0x00;
const SNS_TEMP: u8 = 0x01;
const SNS_HUMD: u8 = 0x02;
const SNS_LUMI: u8 = 0x03;
const SNS_ACCEL: u8 = 0x04;
const SNS_EVENT: u8 = 0x05;
const SNS_VOLT: u8 = 0x30;
const SNS_DATA_INFO: u8 = 0x34;

const EX_VOLT_VCC: u16 = 0x08;
const EX_VOLT_ADC1: u16 = 0x01;
/// Matches any extension byte.
const EX_ANY: u16 = 0xFFFF;

pub const MOT_MAX_SAMPLES: usize = 16;
pub const CUE_MAX_SAMPLES: usize = 10;

// ============================================================================
// Header types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PalBoard {
    Mag,
    Amb,
    Mot,
    Notice,
    Cue,
    Aria,
    Unknown(u8),
}

impl PalBoard {
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => PalBoard::Mag,
            2 => PalBoard::Amb,
            3 => PalBoard::Mot,
            4 => PalBoard::Notice,
            5 => PalBoard::Cue,
            6 => PalBoard::Aria,
            other => PalBoard::Unknown(other),
        }
    }
}

/// PAL record kind, also used as `pkt_type` of the normalised record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PalDataType {
    MagStd,
    AmbStd,
    MotStd,
    ExCueStd,
    ExAriaStd,
    EventOnly,
    Nodef,
}

impl PalDataType {
    pub fn code(self) -> u16 {
        match self {
            PalDataType::MagStd => 0x01,
            PalDataType::AmbStd => 0x02,
            PalDataType::MotStd => 0x03,
            PalDataType::ExCueStd => 0x05,
            PalDataType::ExAriaStd => 0x06,
            PalDataType::EventOnly => 0x80,
            PalDataType::Nodef => 0xFF,
        }
    }
}

/// One raw sensor block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorBlock {
    pub dt: u8,
    pub ds: u8,
    pub ex: u8,
    pub data: Vec<u8>,
}

impl SensorBlock {
    pub fn is_error(&self) -> bool {
        self.dt & 0x80 != 0
    }

    /// Element width in bytes selected by `dt`.
    pub fn element_width(&self) -> usize {
        match self.dt & 0x03 {
            1 => 2,
            2 => 4,
            _ => 1,
        }
    }

    /// Big-endian elements, widened to u32.
    pub fn elements(&self) -> Vec<u32> {
        let width = self.element_width();
        self.data
            .chunks_exact(width)
            .map(|c| c.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalEvent {
    pub source: u8,
    pub id: u8,
    pub param: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalDataInfo {
    pub data_type: u8,
    pub has_event: bool,
    pub source: u8,
    pub cause: u8,
}

// ============================================================================
// Board data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MagState {
    /// 0 no magnet, 1 N pole, 2 S pole
    pub stat: u8,
    pub regular_transmit: bool,
}

impl MagState {
    fn from_raw(raw: u8) -> Self {
        MagState {
            stat: raw & 0x7F,
            regular_transmit: raw & 0x80 != 0,
        }
    }
}

/// Accelerometer sample in milli-G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccelSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Accel {
    pub samples: Vec<AccelSample>,
    /// Upper nibble of the extension byte (0x4 = 100 Hz).
    pub sample_rate_code: u8,
}

impl Accel {
    pub fn has_accel(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Mean of each axis in G.
    pub fn average_g(&self) -> Option<(f64, f64, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        let (sx, sy, sz) = self.sums();
        let div = 1000.0 * self.samples.len() as f64;
        Some((sx as f64 / div, sy as f64 / div, sz as f64 / div))
    }

    /// Integer mean in milli-G for 8-sample bursts, `(sum) >> 3`.
    pub fn average_shift3(&self) -> Option<(i32, i32, i32)> {
        if self.samples.len() != 8 {
            return None;
        }
        let (sx, sy, sz) = self.sums();
        Some((sx >> 3, sy >> 3, sz >> 3))
    }

    fn sums(&self) -> (i32, i32, i32) {
        self.samples.iter().fold((0, 0, 0), |(x, y, z), s| {
            (x + i32::from(s.x), y + i32::from(s.y), z + i32::from(s.z))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalMag {
    pub vcc_mv: Option<u16>,
    pub mag: Option<MagState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalAmb {
    pub vcc_mv: Option<u16>,
    pub temp_c100: Option<i16>,
    pub humidity_pc100: Option<u16>,
    pub lux: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PalMot {
    pub vcc_mv: Option<u16>,
    pub accel: Accel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PalCue {
    pub vcc_mv: Option<u16>,
    pub adc1_mv: Option<u16>,
    pub mag: Option<MagState>,
    pub accel: Accel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalAria {
    pub vcc_mv: Option<u16>,
    pub adc1_mv: Option<u16>,
    pub mag: Option<MagState>,
    pub temp_c100: Option<i16>,
    pub humidity_pc100: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "board", rename_all = "snake_case")]
pub enum PalData {
    Mag(PalMag),
    Amb(PalAmb),
    Motion(PalMot),
    Cue(PalCue),
    Aria(PalAria),
    EventOnly,
    Undefined,
}

// ============================================================================
// Packet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PalPacket {
    /// Repeater serial, or 0x80000000 when received directly.
    pub rpt_addr: u32,
    pub lqi: u8,
    pub seq: u16,
    pub src_addr: u32,
    pub src_lid: u8,
    pub board: PalBoard,
    pub board_rev: u8,
    /// Bit 7 of the board byte clear: the payload carries a data info block.
    pub with_data_info: bool,
    pub blocks: Vec<SensorBlock>,
    pub event: Option<PalEvent>,
    pub data_info: Option<PalDataInfo>,
    pub data: PalData,
}

/// An expected block: sensor code, extension (high byte = mask), element width
/// and maximum element count.
struct Wanted {
    ds: u8,
    ex: u16,
    width: usize,
    max_count: usize,
}

impl Wanted {
    const fn new(ds: u8, ex: u16, width: usize, max_count: usize) -> Self {
        Wanted {
            ds,
            ex,
            width,
            max_count,
        }
    }

    fn matches(&self, block: &SensorBlock) -> bool {
        if block.ds != self.ds || block.is_error() {
            return false;
        }
        if self.ex != EX_ANY {
            let mask = match self.ex >> 8 {
                0 => 0xFF,
                m => m as u8,
            };
            if block.ex & mask != (self.ex as u8) & mask {
                return false;
            }
        }
        block.element_width() == self.width && self.max_count * self.width >= block.data.len()
    }
}

const VCC: Wanted = Wanted::new(SNS_VOLT, EX_VOLT_VCC, 2, 1);
const ADC1: Wanted = Wanted::new(SNS_VOLT, EX_VOLT_ADC1, 2, 1);
const HALL: Wanted = Wanted::new(SNS_HALL, 0x00, 1, 1);
const TEMP: Wanted = Wanted::new(SNS_TEMP, 0x00, 2, 1);
const HUMD: Wanted = Wanted::new(SNS_HUMD, 0x00, 2, 1);
const LUMI: Wanted = Wanted::new(SNS_LUMI, 0x00, 4, 1);
const EVENT: Wanted = Wanted::new(SNS_EVENT, EX_ANY, 4, 1);
const DATA_INFO: Wanted = Wanted::new(SNS_DATA_INFO, 0x00, 1, 8);

impl PalPacket {
    /// Decode a payload already accepted by `identify_packet_type`.
    pub fn parse(payload: &[u8]) -> Result<Self, ClassifyError> {
        let mut r = ByteReader::new(payload, "PAL");

        let rpt_addr = r.u32()?;
        let lqi = r.u8()?;
        let seq = r.u16()?;
        let src_addr = r.u32()?;
        let src_lid = r.u8()?;
        if r.u8()? != 0x80 {
            return Err(ClassifyError::Inconsistent("PAL marker byte"));
        }
        let board_byte = r.u8()?;
        let count = r.u8()?;

        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let dt = r.u8()?;
            let ds = r.u8()?;
            let ex = r.u8()?;
            let ln = r.u8()? as usize;
            blocks.push(SensorBlock {
                dt,
                ds,
                ex,
                data: r.bytes(ln)?.to_vec(),
            });
        }
        // CRC byte, already checked by the classifier.
        r.u8()?;

        let mut packet = PalPacket {
            rpt_addr,
            lqi,
            seq,
            src_addr,
            src_lid,
            board: PalBoard::from_id(board_byte & 0x1F),
            board_rev: (board_byte >> 5) & 0x03,
            with_data_info: board_byte & 0x80 == 0,
            blocks,
            event: None,
            data_info: None,
            data: PalData::Undefined,
        };

        if packet.with_data_info {
            let info = packet
                .find(&DATA_INFO)
                .filter(|b| b.data.len() == 3)
                .map(|b| PalDataInfo {
                    data_type: b.data[0] & 0x7F,
                    has_event: b.data[0] & 0x80 != 0,
                    source: b.data[1],
                    cause: b.data[2],
                })
                .ok_or(ClassifyError::Inconsistent("PAL data info block missing"))?;
            packet.data_info = Some(info);
        }

        let event_expected = packet.data_info.map_or(true, |i| i.has_event);
        if event_expected {
            packet.event = packet.find(&EVENT).and_then(|b| {
                b.elements().first().map(|&v| PalEvent {
                    source: b.ex,
                    id: (v >> 24) as u8,
                    param: v & 0x00FF_FFFF,
                })
            });
            if packet.data_info.is_some() && packet.event.is_none() {
                return Err(ClassifyError::Inconsistent("PAL event flagged but absent"));
            }
        }

        packet.data = packet.decode_data();
        Ok(packet)
    }

    pub fn has_event(&self) -> bool {
        self.event.is_some()
    }

    pub fn data_type(&self) -> PalDataType {
        if self.with_data_info {
            match self.board {
                PalBoard::Cue => return PalDataType::ExCueStd,
                PalBoard::Aria => return PalDataType::ExAriaStd,
                _ if self.has_event() => return PalDataType::EventOnly,
                _ => {}
            }
        } else {
            match self.board {
                PalBoard::Amb => return PalDataType::AmbStd,
                PalBoard::Mag => return PalDataType::MagStd,
                PalBoard::Mot => return PalDataType::MotStd,
                PalBoard::Notice => return PalDataType::EventOnly,
                _ => {}
            }
        }
        PalDataType::Nodef
    }

    /// Supply voltage block (VOLT/VCC), present on every board.
    pub fn vcc_mv(&self) -> Option<u16> {
        self.u16_of(&VCC)
    }

    /// Last non-error block matching `wanted`.
    fn find(&self, wanted: &Wanted) -> Option<&SensorBlock> {
        self.blocks.iter().rev().find(|b| wanted.matches(b))
    }

    fn u16_of(&self, wanted: &Wanted) -> Option<u16> {
        self.find(wanted)
            .and_then(|b| b.elements().first().copied())
            .map(|v| v as u16)
    }

    fn u32_of(&self, wanted: &Wanted) -> Option<u32> {
        self.find(wanted).and_then(|b| b.elements().first().copied())
    }

    fn mag(&self) -> Option<MagState> {
        self.find(&HALL)
            .and_then(|b| b.data.first())
            .map(|&raw| MagState::from_raw(raw))
    }

    /// Consecutive accel samples 0..max; stops at the first missing index.
    fn accel(&self, max_samples: usize) -> Accel {
        let mut accel = Accel::default();
        for i in 0..max_samples {
            let wanted = Wanted::new(SNS_ACCEL, 0x0F00 | i as u16, 2, 3);
            let Some(block) = self.find(&wanted) else {
                break;
            };
            let v = block.elements();
            if v.len() < 3 {
                break;
            }
            accel.sample_rate_code = block.ex >> 4;
            accel.samples.push(AccelSample {
                x: v[0] as u16 as i16,
                y: v[1] as u16 as i16,
                z: v[2] as u16 as i16,
            });
        }
        accel
    }

    fn decode_data(&self) -> PalData {
        let vcc_mv = self.vcc_mv();
        match self.data_type() {
            PalDataType::MagStd => PalData::Mag(PalMag {
                vcc_mv,
                mag: self.mag(),
            }),
            PalDataType::AmbStd => PalData::Amb(PalAmb {
                vcc_mv,
                temp_c100: self.u16_of(&TEMP).map(|v| v as i16),
                humidity_pc100: self.u16_of(&HUMD),
                lux: self.u32_of(&LUMI),
            }),
            PalDataType::MotStd => PalData::Motion(PalMot {
                vcc_mv,
                accel: self.accel(MOT_MAX_SAMPLES),
            }),
            PalDataType::ExCueStd => PalData::Cue(PalCue {
                vcc_mv,
                adc1_mv: self.u16_of(&ADC1),
                mag: self.mag(),
                accel: self.accel(CUE_MAX_SAMPLES),
            }),
            PalDataType::ExAriaStd => PalData::Aria(PalAria {
                vcc_mv,
                adc1_mv: self.u16_of(&ADC1),
                mag: self.mag(),
                temp_c100: self.u16_of(&TEMP).map(|v| v as i16),
                humidity_pc100: self.u16_of(&HUMD),
            }),
            PalDataType::EventOnly => PalData::EventOnly,
            PalDataType::Nodef => PalData::Undefined,
        }
    }
}

// ============================================================================
// Test payload builder
// ============================================================================

/// Builds PAL payloads block by block and closes them with the CRC.
#[cfg(test)]
pub(crate) struct PalBuilder {
    header: Vec<u8>,
    blocks: Vec<u8>,
    count: u8,
}

#[cfg(test)]
impl PalBuilder {
    pub(crate) fn new(src_addr: u32, seq: u16, board_byte: u8) -> Self {
        let mut header = vec![0x80, 0x00, 0x00, 0x00, 0xA8];
        header.extend_from_slice(&seq.to_be_bytes());
        header.extend_from_slice(&src_addr.to_be_bytes());
        header.extend_from_slice(&[0x01, 0x80, board_byte]);
        PalBuilder {
            header,
            blocks: Vec::new(),
            count: 0,
        }
    }

    pub(crate) fn block(mut self, dt: u8, ds: u8, ex: u8, data: &[u8]) -> Self {
        self.blocks.extend_from_slice(&[dt, ds, ex, data.len() as u8]);
        self.blocks.extend_from_slice(data);
        self.count += 1;
        self
    }

    pub(crate) fn vcc(self, mv: u16) -> Self {
        self.block(0x11, SNS_VOLT, 0x08, &mv.to_be_bytes())
    }

    pub(crate) fn hall(self, raw: u8) -> Self {
        self.block(0x00, SNS_HALL, 0x00, &[raw])
    }

    pub(crate) fn data_info(self, data_type: u8, source: u8, cause: u8) -> Self {
        self.block(0x00, SNS_DATA_INFO, 0x00, &[data_type, source, cause])
    }

    pub(crate) fn accel(self, index: u8, x: i16, y: i16, z: i16) -> Self {
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&x.to_be_bytes());
        data.extend_from_slice(&y.to_be_bytes());
        data.extend_from_slice(&z.to_be_bytes());
        self.block(0x15, SNS_ACCEL, 0x40 | index, &data)
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut out = self.header;
        out.push(self.count);
        out.extend_from_slice(&self.blocks);
        out.push(crate::checksums::crc8_twelite_checksum(&out));
        out
    }
}
