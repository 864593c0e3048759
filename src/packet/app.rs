// src/packet/app.rs
//
// Fixed-layout application packets: App_Twelite (0x81), App_IO, App_UART
// extended format (also used by act), and App_Tag.

use serde::Serialize;

use super::ByteReader;
use crate::error::ClassifyError;

/// Radio timestamp word: low 15 bits are the tick, bit 15 flags low-latency mode.
fn split_timestamp(word: u16) -> (u16, bool) {
    (word & 0x7FFF, word & 0x8000 != 0)
}

// ============================================================================
// App_Twelite
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppTwelite {
    pub src_lid: u8,
    pub packet_id: u8,
    pub version: u8,
    pub lqi: u8,
    pub src_addr: u32,
    pub dst_lid: u8,
    pub timestamp: u16,
    pub low_latency: bool,
    pub repeat_count: u8,
    pub vcc_mv: u16,
    /// DI1..DI4 state in bits 0..3.
    pub di_mask: u8,
    pub di_active_mask: u8,
    /// ADC1..ADC4 in mV, `None` when the channel is inactive.
    pub adc_mv: [Option<u16>; 4],
}

impl AppTwelite {
    pub fn parse(payload: &[u8]) -> Result<Self, ClassifyError> {
        if payload.len() != 23 {
            return Err(ClassifyError::Truncated {
                kind: "TWELITE",
                need: 23,
                got: payload.len(),
            });
        }
        let mut r = ByteReader::new(payload, "TWELITE");

        let src_lid = r.u8()?;
        r.u8()?; // 0x81
        let packet_id = r.u8()?;
        let version = r.u8()?;
        let lqi = r.u8()?;
        let src_addr = r.u32()?;
        let dst_lid = r.u8()?;
        let (timestamp, low_latency) = split_timestamp(r.u16()?);
        let repeat_count = r.u8()?;
        let vcc_mv = r.u16()?;
        r.u8()?; // unused
        let di_mask = r.u8()?;
        let di_active_mask = r.u8()?;
        let raw_adc = r.bytes(4)?;
        let extra = r.u8()?;

        let mut adc_mv = [None; 4];
        for (k, (&adc, slot)) in raw_adc.iter().zip(adc_mv.iter_mut()).enumerate() {
            if adc != 0xFF {
                let low = u16::from((extra >> (2 * k)) & 0x03);
                *slot = Some((u16::from(adc) * 4 + low) * 4);
            }
        }

        Ok(AppTwelite {
            src_lid,
            packet_id,
            version,
            lqi,
            src_addr,
            dst_lid,
            timestamp,
            low_latency,
            repeat_count,
            vcc_mv,
            di_mask,
            di_active_mask,
            adc_mv,
        })
    }

    pub fn di(&self, index: usize) -> bool {
        index < 4 && self.di_mask & (1 << index) != 0
    }
}

// ============================================================================
// App_IO
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppIo {
    pub src_lid: u8,
    pub packet_id: u8,
    pub version: u8,
    pub lqi: u8,
    pub src_addr: u32,
    pub dst_lid: u8,
    pub timestamp: u16,
    pub low_latency: bool,
    pub repeat_count: u8,
    pub di_mask: u16,
    pub di_active_mask: u16,
    pub di_int_mask: u16,
}

impl AppIo {
    pub fn parse(payload: &[u8]) -> Result<Self, ClassifyError> {
        if payload.len() != 20 {
            return Err(ClassifyError::Truncated {
                kind: "APPIO",
                need: 20,
                got: payload.len(),
            });
        }
        let mut r = ByteReader::new(payload, "APPIO");

        let src_lid = r.u8()?;
        r.u8()?; // 0x81
        let packet_id = r.u8()?;
        let version = r.u8()?;
        let lqi = r.u8()?;
        let src_addr = r.u32()?;
        let dst_lid = r.u8()?;
        let (timestamp, low_latency) = split_timestamp(r.u16()?);
        let repeat_count = r.u8()?;

        Ok(AppIo {
            src_lid,
            packet_id,
            version,
            lqi,
            src_addr,
            dst_lid,
            timestamp,
            low_latency,
            repeat_count,
            di_mask: r.u16()?,
            di_active_mask: r.u16()?,
            di_int_mask: r.u16()?,
        })
    }
}

// ============================================================================
// App_UART extended / act
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppUart {
    pub src_lid: u8,
    pub command: u8,
    pub response_id: u8,
    pub src_addr: u32,
    /// 0xFFFFFFFF when the sender gave no destination.
    pub dst_addr: u32,
    pub lqi: u8,
    pub payload: Vec<u8>,
}

impl AppUart {
    pub fn parse(payload: &[u8], kind: &'static str) -> Result<Self, ClassifyError> {
        let mut r = ByteReader::new(payload, kind);

        let src_lid = r.u8()?;
        let command = r.u8()?;
        let response_id = r.u8()?;
        let src_addr = r.u32()?;
        let dst_addr = r.u32()?;
        let lqi = r.u8()?;
        let len = r.u16()? as usize;
        let data = r.bytes(len)?.to_vec();

        Ok(AppUart {
            src_lid,
            command,
            response_id,
            src_addr,
            dst_addr,
            lqi,
            payload: data,
        })
    }
}

// ============================================================================
// App_Tag
// ============================================================================

/// Supply voltage from the one-byte App_Tag encoding.
pub fn decode_volt(code: u8) -> u16 {
    let i = u16::from(code);
    if i <= 170 {
        1950 + i * 5
    } else {
        2800 + (i - 170) * 10
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppTag {
    pub rpt_addr: u32,
    pub lqi: u8,
    pub seq: u16,
    pub src_addr: u32,
    pub src_lid: u8,
    pub sensor: u8,
    pub vcc_mv: u16,
    pub payload: Vec<u8>,
}

impl AppTag {
    pub fn parse(payload: &[u8]) -> Result<Self, ClassifyError> {
        let mut r = ByteReader::new(payload, "APPTAG");

        let rpt_addr = r.u32()?;
        let lqi = r.u8()?;
        let seq = r.u16()?;
        let src_addr = r.u32()?;
        let src_lid = r.u8()?;
        let sensor = r.u8()?;
        let vcc_mv = decode_volt(r.u8()?);

        Ok(AppTag {
            rpt_addr,
            lqi,
            seq,
            src_addr,
            src_lid,
            sensor,
            vcc_mv,
            payload: r.rest().to_vec(),
        })
    }
}
