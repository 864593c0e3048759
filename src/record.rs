// src/record.rs
//
// The canonical sensor record produced by the normalizer and persisted by the
// store. One row of `sensor_data`.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::Serialize;

// ============================================================================
// Record kinds (pkt_type)
// ============================================================================

/// `pkt_type` values. PAL records carry their `PalDataType` byte.
pub mod pkt_type {
    pub const MAG_STD: u16 = 0x01;
    pub const AMB_STD: u16 = 0x02;
    pub const MOT_STD: u16 = 0x03;
    pub const EX_CUE_STD: u16 = 0x05;
    pub const EX_ARIA_STD: u16 = 0x06;
    pub const EVENT_ONLY: u16 = 0x80;
    pub const NODEF: u16 = 0xFF;
    pub const APP_TWELITE: u16 = 0x101;
    pub const APP_IO: u16 = 0x103;
}

/// `val_dio` bit set when the magnet status byte is encoded in the top byte.
pub const DIO_MAG_PRESENT: u32 = 0x1000_0000;

/// Encode a PAL magnet status into `val_dio`.
pub fn mag_to_dio(stat: u8) -> u32 {
    (u32::from(stat) + 0x10) << 24
}

// ============================================================================
// SensorRecord
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SensorRecord {
    pub sid: u32,
    /// Unix epoch seconds. Assigned from arrival time by the normalizer.
    pub ts: Option<i64>,
    pub ts_msec: u16,
    pub lid: Option<u8>,
    pub lqi: Option<u8>,
    pub pkt_seq: Option<u16>,
    pub pkt_type: u16,
    pub value: Option<f64>,
    pub value1: Option<f64>,
    pub value2: Option<f64>,
    pub value3: Option<f64>,
    pub val_vcc_mv: Option<i32>,
    pub val_dio: Option<u32>,
    pub val_adc1_mv: Option<i32>,
    pub val_adc2_mv: Option<i32>,
    pub val_aux: Option<i32>,
    pub ev_src: Option<u8>,
    pub ev_id: Option<u8>,
    pub ev_param: Option<u32>,
}

/// Local-time calendar fields derived from a record timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calendar {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl Calendar {
    pub fn from_epoch(ts: i64) -> Option<Self> {
        let dt = Local.timestamp_opt(ts, 0).earliest()?;
        Some(Self::from_datetime(&dt))
    }

    pub fn from_datetime(dt: &DateTime<Local>) -> Self {
        Calendar {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }
}

impl SensorRecord {
    pub fn new(sid: u32, pkt_type: u16) -> Self {
        SensorRecord {
            sid,
            pkt_type,
            ..Default::default()
        }
    }

    /// Stamp the record with a wall-clock time (seconds + milliseconds).
    pub fn with_time(mut self, at: &DateTime<Local>) -> Self {
        self.ts = Some(at.timestamp());
        self.ts_msec = at.timestamp_subsec_millis().min(999) as u16;
        self
    }

    /// Arrival time in milliseconds, when the record has a timestamp.
    pub fn ts_millis(&self) -> Option<i64> {
        self.ts.map(|t| t * 1000 + i64::from(self.ts_msec))
    }

    pub fn calendar(&self) -> Option<Calendar> {
        self.ts.and_then(Calendar::from_epoch)
    }

    /// True when `val_dio` carries a magnet status.
    pub fn has_mag(&self) -> bool {
        self.val_dio.is_some_and(|d| d & DIO_MAG_PRESENT != 0)
    }

    /// Magnet status (0 none, 1 N pole, 2 S pole) when present.
    pub fn mag_stat(&self) -> Option<u8> {
        match self.val_dio {
            Some(d) if d & DIO_MAG_PRESENT != 0 => Some(((d >> 24) & 0x0F) as u8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mag_encoding() {
        let mut r = SensorRecord::new(0x810E_E29A, pkt_type::EX_CUE_STD);
        assert!(!r.has_mag());
        assert_eq!(r.mag_stat(), None);

        r.val_dio = Some(mag_to_dio(1));
        assert_eq!(r.val_dio, Some(0x1100_0000));
        assert!(r.has_mag());
        assert_eq!(r.mag_stat(), Some(1));

        // App_Twelite DI bits never reach the magnet flag
        r.val_dio = Some(0x8000_0005);
        assert!(!r.has_mag());
    }

    #[test]
    fn test_with_time_sets_millis() {
        let at = Local.timestamp_millis_opt(1_700_000_123_456).unwrap();
        let r = SensorRecord::new(1, pkt_type::APP_IO).with_time(&at);
        assert_eq!(r.ts, Some(1_700_000_123));
        assert_eq!(r.ts_msec, 456);
        assert_eq!(r.ts_millis(), Some(1_700_000_123_456));
    }

    #[test]
    fn test_calendar_matches_chrono() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 17, 5, 0).unwrap();
        let r = SensorRecord::new(1, pkt_type::AMB_STD).with_time(&at);
        assert_eq!(
            r.calendar(),
            Some(Calendar {
                year: 2024,
                month: 3,
                day: 9,
                hour: 17
            })
        );
        assert_eq!(SensorRecord::new(1, 1).calendar(), None);
    }
}
