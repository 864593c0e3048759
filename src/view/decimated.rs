// src/view/decimated.rs
//
// Display buffer: `width` buckets over the window, each averaging every record
// that falls into it.

use serde::Serialize;

use crate::record::{pkt_type, SensorRecord, DIO_MAG_PRESENT};

// Presence bitmap of channels seen since the last reset.
pub const BM_VALUE: u8 = 0x01;
pub const BM_VALUE1: u8 = 0x02;
pub const BM_VALUE2: u8 = 0x04;
pub const BM_VALUE3: u8 = 0x08;
pub const BM_VCC: u8 = 0x10;
pub const BM_MAG: u8 = 0x20;
pub const BM_EV_ID: u8 = 0x40;

/// Running sums of the averaged channels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ChannelSums {
    value: Option<f64>,
    value1: Option<f64>,
    value2: Option<f64>,
    value3: Option<f64>,
    vcc_mv: Option<i64>,
    lqi: Option<i64>,
}

fn accumulate<T: std::ops::Add<Output = T> + Copy>(sum: &mut Option<T>, v: Option<T>) {
    if let Some(v) = v {
        *sum = Some(sum.map_or(v, |s| s + v));
    }
}

impl ChannelSums {
    fn add(&mut self, r: &SensorRecord) {
        accumulate(&mut self.value, r.value);
        accumulate(&mut self.value1, r.value1);
        accumulate(&mut self.value2, r.value2);
        accumulate(&mut self.value3, r.value3);
        accumulate(&mut self.vcc_mv, r.val_vcc_mv.map(i64::from));
        accumulate(&mut self.lqi, r.lqi.map(i64::from));
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Bucket {
    /// First record of the bucket; averaged channels are rewritten by `finalize`.
    record: Option<SensorRecord>,
    #[serde(skip)]
    sums: ChannelSums,
    count: u32,
}

impl Bucket {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn record(&self) -> Option<&SensorRecord> {
        self.record.as_ref()
    }

    fn add(&mut self, r: &SensorRecord) {
        if self.record.is_none() {
            self.record = Some(r.clone());
        }
        self.sums.add(r);
        self.count += 1;
    }

    fn finalize(&mut self) {
        let (Some(rec), ct) = (self.record.as_mut(), self.count) else {
            return;
        };
        if ct == 0 {
            return;
        }
        let s = &self.sums;
        let n = f64::from(ct);
        rec.value = s.value.map(|v| v / n);
        rec.value1 = s.value1.map(|v| v / n);
        rec.value2 = s.value2.map(|v| v / n);
        rec.value3 = s.value3.map(|v| v / n);
        rec.val_vcc_mv = s.vcc_mv.map(|v| (v / i64::from(ct)) as i32);
        rec.lqi = s.lqi.map(|v| (v / i64::from(ct)) as u8);
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecimatedBuffer {
    buckets: Vec<Bucket>,
    t_start: i64,
    t_step: i64,
    bitmap: u8,
    data_type: u16,
    plot_points: usize,
}

impl DecimatedBuffer {
    pub fn new() -> Self {
        DecimatedBuffer {
            data_type: pkt_type::NODEF,
            ..Default::default()
        }
    }

    /// Drop all contents and lay out `width` buckets of `t_step` seconds from `t_start`.
    pub fn reset(&mut self, t_start: i64, t_step: i64, width: usize) {
        self.buckets.clear();
        self.buckets.resize_with(width, Bucket::default);
        self.t_start = t_start;
        self.t_step = t_step.max(1);
        self.bitmap = 0;
        self.data_type = pkt_type::NODEF;
        self.plot_points = 0;
    }

    pub fn width(&self) -> usize {
        self.buckets.len()
    }

    /// Start epoch of bucket `index`.
    pub fn bucket_epoch(&self, index: usize) -> i64 {
        self.t_start + index as i64 * self.t_step
    }

    pub fn add(&mut self, r: &SensorRecord) -> Option<usize> {
        let ts = r.ts?;
        if ts < self.t_start {
            return None;
        }
        let i = ((ts - self.t_start) / self.t_step) as usize;
        let bucket = self.buckets.get_mut(i)?;
        bucket.add(r);

        if r.value.is_some() {
            self.bitmap |= BM_VALUE;
        }
        if r.value1.is_some() {
            self.bitmap |= BM_VALUE1;
        }
        if r.value2.is_some() {
            self.bitmap |= BM_VALUE2;
        }
        if r.value3.is_some() {
            self.bitmap |= BM_VALUE3;
        }
        if r.val_vcc_mv.is_some() {
            self.bitmap |= BM_VCC;
        }
        if r.val_dio.is_some_and(|d| d & DIO_MAG_PRESENT != 0) {
            self.bitmap |= BM_MAG;
        }
        if r.ev_id.is_some() {
            self.bitmap |= BM_EV_ID;
        }
        if self.data_type == pkt_type::NODEF && r.pkt_type != pkt_type::NODEF {
            self.data_type = r.pkt_type;
        }
        Some(i)
    }

    /// Turn running sums into averages and recount populated buckets.
    pub fn finalize(&mut self) {
        self.plot_points = 0;
        for b in self.buckets.iter_mut().filter(|b| !b.is_empty()) {
            b.finalize();
            self.plot_points += 1;
        }
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn record(&self, index: usize) -> Option<&SensorRecord> {
        self.bucket(index).and_then(Bucket::record)
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bitmap(&self) -> u8 {
        self.bitmap
    }

    /// First non-NODEF `pkt_type` added since the last reset.
    pub fn data_type(&self) -> u16 {
        self.data_type
    }

    /// Populated buckets as of the last `finalize`.
    pub fn plot_points(&self) -> usize {
        self.plot_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::mag_to_dio;

    fn rec(ts: i64, v: f64) -> SensorRecord {
        let mut r = SensorRecord::new(3, pkt_type::AMB_STD);
        r.ts = Some(ts);
        r.value = Some(v);
        r.val_vcc_mv = Some(3001);
        r.lqi = Some(200);
        r
    }

    #[test]
    fn test_average_within_bucket() {
        let mut buf = DecimatedBuffer::new();
        buf.reset(0, 10, 4);
        assert_eq!(buf.add(&rec(0, 1.0)), Some(0));
        assert_eq!(buf.add(&rec(9, 2.0)), Some(0));
        let mut r = rec(5, 3.0);
        r.val_vcc_mv = Some(3000);
        r.lqi = Some(100);
        buf.add(&r);
        assert_eq!(buf.add(&rec(35, 7.0)), Some(3));
        assert_eq!(buf.add(&rec(40, 0.0)), None);
        buf.finalize();

        let b = buf.bucket(0).unwrap();
        assert_eq!(b.count(), 3);
        let avg = b.record().unwrap();
        assert!((avg.value.unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(avg.val_vcc_mv, Some(3000));
        assert_eq!(avg.lqi, Some(166));
        assert_eq!(buf.plot_points(), 2);
        assert!(buf.bucket(1).unwrap().is_empty());

        // a second finalize does not divide again
        buf.finalize();
        assert!((buf.record(0).unwrap().value.unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_bitmap_and_data_type() {
        let mut buf = DecimatedBuffer::new();
        buf.reset(0, 1, 10);
        let mut nodef = SensorRecord::new(1, pkt_type::NODEF);
        nodef.ts = Some(0);
        buf.add(&nodef);
        assert_eq!(buf.data_type(), pkt_type::NODEF);

        let mut r = SensorRecord::new(1, pkt_type::EX_ARIA_STD);
        r.ts = Some(1);
        r.value1 = Some(50.0);
        r.val_dio = Some(mag_to_dio(1));
        r.ev_id = Some(2);
        buf.add(&r);
        let mut later = SensorRecord::new(1, pkt_type::AMB_STD);
        later.ts = Some(2);
        buf.add(&later);

        assert_eq!(buf.data_type(), pkt_type::EX_ARIA_STD);
        assert_eq!(buf.bitmap(), BM_VALUE1 | BM_MAG | BM_EV_ID);

        buf.reset(0, 1, 10);
        assert_eq!(buf.bitmap(), 0);
        assert_eq!(buf.data_type(), pkt_type::NODEF);
        assert_eq!(buf.bucket_epoch(3), 3);
    }
}
