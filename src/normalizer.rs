// src/normalizer.rs
//
// Decoded packet -> SensorRecord.
//
// Picks which generic channel carries which quantity per record kind and, for
// accelerometer bursts, stamps every sample with an estimated time derived from
// the recent packet arrival rate of that device.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::error::ClassifyError;
use crate::packet::{Accel, AppIo, AppTwelite, MagState, Packet, PalData, PalPacket};
use crate::record::{mag_to_dio, pkt_type, SensorRecord};

// ============================================================================
// Constants
// ============================================================================

/// Arrival gaps above this are not part of the sample-rate estimate.
pub const CONTIGUOUS_GAP_MS: i64 = 2000;
/// Arrival times remembered per device.
pub const ARRIVAL_HISTORY: usize = 10;
/// Placeholder samples inserted at a discontinuity.
pub const PLACEHOLDER_RUN: usize = 4;
/// Sample period (ms, Q10) used until enough arrivals are known.
pub const DEFAULT_PERIOD_Q10: i64 = 10 * 1024;

const DI_LOW_LATENCY_BIT: u8 = 0x80;
const DIO_FLAG_BIT: u32 = 0x8000_0000;

// ============================================================================
// Output types
// ============================================================================

/// One accelerometer sample with its estimated time, in G.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccelPoint {
    pub t_pkt_ms: i64,
    pub seq: u16,
    pub t_ms: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TrailSample {
    Sample(AccelPoint),
    /// No data: marks a discontinuity in the sample stream.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Normalized {
    pub record: SensorRecord,
    /// Per-sample trail for accelerometer packets, placeholders first.
    pub samples: Vec<TrailSample>,
}

// ============================================================================
// Sample period estimation
// ============================================================================

/// Rolling arrival history of one device.
#[derive(Debug, Default)]
pub struct SamplePeriodEstimator {
    arrivals: VecDeque<i64>,
}

impl SamplePeriodEstimator {
    /// Record an arrival carrying `samples` samples and return the estimated
    /// sample period in ms, Q10 fixed point.
    pub fn push(&mut self, t_ms: i64, samples: usize) -> i64 {
        if self.arrivals.len() == ARRIVAL_HISTORY {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(t_ms);

        let mut n_samples = 0i64;
        let mut period = 0i64;
        if self.arrivals.len() >= 3 {
            for (prev, next) in self.arrivals.iter().zip(self.arrivals.iter().skip(1)) {
                let td = next - prev;
                if td <= CONTIGUOUS_GAP_MS {
                    n_samples += samples as i64;
                    period += td;
                }
            }
        }

        if n_samples >= 2 {
            period * 1024 / (n_samples - 1)
        } else {
            DEFAULT_PERIOD_Q10
        }
    }

    pub fn last_arrival(&self) -> Option<i64> {
        self.arrivals.back().copied()
    }
}

#[derive(Debug, Default)]
struct DeviceTiming {
    estimator: SamplePeriodEstimator,
    last_seq: Option<u16>,
}

// ============================================================================
// Normalizer
// ============================================================================

#[derive(Debug, Default)]
pub struct Normalizer {
    devices: HashMap<u32, DeviceTiming>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a decoded packet received at `now` into a record.
    /// Packets that carry no sensor record are `ClassifyError::NoRecord`.
    pub fn normalize(
        &mut self,
        packet: &Packet,
        now: &DateTime<Local>,
    ) -> Result<Normalized, ClassifyError> {
        match packet {
            Packet::Pal(pal) => self.normalize_pal(pal, now),
            Packet::Twelite(t) => Ok(Normalized {
                record: twelite_record(t).with_time(now),
                samples: Vec::new(),
            }),
            Packet::AppIo(io) => Ok(Normalized {
                record: app_io_record(io).with_time(now),
                samples: Vec::new(),
            }),
            Packet::AppUart(_) => Err(ClassifyError::NoRecord("APPUART")),
            Packet::ActStd(_) => Err(ClassifyError::NoRecord("ACT_STD")),
            Packet::AppTag(_) => Err(ClassifyError::NoRecord("APPTAG")),
        }
    }

    fn normalize_pal(
        &mut self,
        pal: &PalPacket,
        now: &DateTime<Local>,
    ) -> Result<Normalized, ClassifyError> {
        let mut record = SensorRecord::new(pal.src_addr, pal.data_type().code()).with_time(now);
        record.pkt_seq = Some(pal.seq);
        record.lid = Some(pal.src_lid);
        record.lqi = Some(pal.lqi);
        if let Some(ev) = pal.event {
            record.ev_src = Some(ev.source);
            record.ev_id = Some(ev.id);
            record.ev_param = Some(ev.param);
        }

        let mut samples = Vec::new();
        match &pal.data {
            PalData::Mag(mag) => {
                record.val_vcc_mv = mag.vcc_mv.map(i32::from);
                if let Some(m) = mag.mag {
                    record.val_dio = Some(mag_to_dio(m.stat));
                    record.value = Some(f64::from(m.stat & 0x03));
                }
            }
            PalData::Amb(amb) => {
                record.val_vcc_mv = amb.vcc_mv.map(i32::from);
                record.value = amb.temp_c100.map(|t| f64::from(t) / 100.0);
                record.value1 = amb.humidity_pc100.map(|h| f64::from(h) / 100.0);
                record.value2 = amb.lux.map(f64::from);
            }
            // ARIA carries no luminance channel, so value2 stays empty
            PalData::Aria(aria) => {
                record.val_vcc_mv = aria.vcc_mv.map(i32::from);
                record.val_adc1_mv = aria.adc1_mv.map(i32::from);
                set_mag(&mut record, aria.mag);
                record.value = aria.temp_c100.map(|t| f64::from(t) / 100.0);
                record.value1 = aria.humidity_pc100.map(|h| f64::from(h) / 100.0);
            }
            PalData::Cue(cue) => {
                record.val_vcc_mv = cue.vcc_mv.map(i32::from);
                record.val_adc1_mv = cue.adc1_mv.map(i32::from);
                set_mag(&mut record, cue.mag);
                set_accel_average(&mut record, &cue.accel);
                samples = self.stamp_samples(pal, &cue.accel, now);
            }
            PalData::Motion(mot) => {
                record.val_vcc_mv = mot.vcc_mv.map(i32::from);
                set_accel_average(&mut record, &mot.accel);
                samples = self.stamp_samples(pal, &mot.accel, now);
            }
            PalData::EventOnly => return Err(ClassifyError::NoRecord("PAL EVENT_ONLY")),
            PalData::Undefined => return Err(ClassifyError::NoRecord("PAL NODEF")),
        }

        Ok(Normalized { record, samples })
    }

    /// Estimate per-sample times for an accelerometer burst. A long silence or a
    /// sequence jump since the previous packet of the device is marked with a
    /// run of placeholders.
    fn stamp_samples(&mut self, pal: &PalPacket, accel: &Accel, now: &DateTime<Local>) -> Vec<TrailSample> {
        if !accel.has_accel() {
            return Vec::new();
        }
        let t_pkt = now.timestamp_millis();
        let device = self.devices.entry(pal.src_addr).or_default();

        let gap = device
            .estimator
            .last_arrival()
            .is_some_and(|last| t_pkt - last > CONTIGUOUS_GAP_MS);
        let seq_jump = device
            .last_seq
            .is_some_and(|last| last.wrapping_add(1) != pal.seq);
        device.last_seq = Some(pal.seq);

        let period_q10 = device.estimator.push(t_pkt, accel.samples.len());

        let mut out = Vec::with_capacity(accel.samples.len() + PLACEHOLDER_RUN);
        if gap || seq_jump {
            out.extend(std::iter::repeat(TrailSample::Placeholder).take(PLACEHOLDER_RUN));
        }
        out.extend(accel.samples.iter().enumerate().map(|(i, s)| {
            TrailSample::Sample(AccelPoint {
                t_pkt_ms: t_pkt,
                seq: pal.seq,
                t_ms: t_pkt + ((i as i64 * period_q10) >> 10),
                x: f64::from(s.x) / 1000.0,
                y: f64::from(s.y) / 1000.0,
                z: f64::from(s.z) / 1000.0,
            })
        }));
        out
    }

    /// Forget timing state of a device (e.g. when it is deselected).
    pub fn reset_device(&mut self, sid: u32) {
        self.devices.remove(&sid);
    }
}

fn set_mag(record: &mut SensorRecord, mag: Option<MagState>) {
    if let Some(m) = mag {
        record.val_dio = Some(mag_to_dio(m.stat));
    }
}

fn set_accel_average(record: &mut SensorRecord, accel: &Accel) {
    if let Some((x, y, z)) = accel.average_g() {
        record.value = Some(x);
        record.value1 = Some(y);
        record.value2 = Some(z);
    }
}

fn twelite_record(t: &AppTwelite) -> SensorRecord {
    let mut record = SensorRecord::new(t.src_addr, pkt_type::APP_TWELITE);
    let bm_di = t.di_mask & 0x0F;

    record.lid = Some(t.src_lid);
    record.lqi = Some(t.lqi);
    record.pkt_seq = Some(t.timestamp);
    record.value = Some(f64::from(bm_di));
    record.val_dio = Some(if t.di_mask & DI_LOW_LATENCY_BIT != 0 {
        u32::from(bm_di) | DIO_FLAG_BIT
    } else {
        u32::from(bm_di)
    });
    record.val_aux = Some(i32::from(t.di_active_mask));
    record.val_vcc_mv = Some(i32::from(t.vcc_mv));

    let volts = |mv: u16| f64::from(mv) / 1000.0;
    if let Some(mv) = t.adc_mv[0] {
        record.val_adc1_mv = Some(i32::from(mv));
        record.value1 = Some(volts(mv));
    }
    if let Some(mv) = t.adc_mv[1] {
        record.value2 = Some(volts(mv));
    }
    if let Some(mv) = t.adc_mv[2] {
        record.value3 = Some(volts(mv));
    }
    if let Some(mv) = t.adc_mv[3] {
        record.val_adc2_mv = Some(i32::from(mv));
        record.value3 = Some(volts(mv));
    }
    record
}

fn app_io_record(io: &AppIo) -> SensorRecord {
    let mut record = SensorRecord::new(io.src_addr, pkt_type::APP_IO);
    record.lid = Some(io.src_lid);
    record.lqi = Some(io.lqi);
    record.pkt_seq = Some(io.timestamp);
    record.value = Some(f64::from(io.di_mask));
    record.val_dio = Some(u32::from(io.di_mask));
    record.val_aux = Some(i32::from(io.di_active_mask));
    record
}
