// src/csv_export.rs
//
// CSV export of stored days, the displayed view window and the accelerometer
// trail. Plain comma-separated text, one header row.

use chrono::{Local, TimeZone};
use rusqlite::types::Value;
use std::io::Write;

use crate::error::ExportError;
use crate::live_buffer::LiveBuffer;
use crate::normalizer::TrailSample;
use crate::store::{day_range, WsnsStore};
use crate::view::{MultiResolutionView, DRAW_WIDTH};

pub const ACCEL_HEADER: &str = "#,T_PKT[ms],SEQ,T_SMPL[ms],X[G],Y[G],Z[G]";

const VIEW_COLUMNS: [&str; 13] = [
    "#", "ts", "date", "count", "sid", "pkt_type", "value", "value1", "value2", "value3", "val_vcc_mv", "lqi",
    "val_dio",
];

pub fn export_file_name(sid: u32, year: i32, month: u32, day: u32) -> String {
    format!("WSns_{:08X}_{:04}-{:02}-{:02}.csv", sid, year, month, day)
}

fn format_date(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .map(|dt| dt.format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Fixed-width rendering of a REAL column: fewer decimals as the magnitude grows.
pub fn format_real(d: f64) -> String {
    if d == 0.0 {
        return "0.0".to_string();
    }
    let a = d.abs() + 0.000_000_5;
    let sign = if d < 0.0 { "-" } else { "" };
    let int = a.trunc();
    let frac = a - int;
    let n_frac = (frac * 1_000_000.0) as i64;
    let n_int = if a < f64::from(i32::MAX) { int as i64 } else { i64::from(i32::MAX) };

    let body = if a < 0.001 {
        format!("{:.6e}", frac)
    } else if a < 1.0 {
        format!("{:.6}", frac)
    } else if n_int < 1000 {
        format!("{}.{:03}", n_int, n_frac / 1000)
    } else if n_int < 10_000 {
        format!("{}.{:02}", n_int, n_frac / 10_000)
    } else if n_int < 100_000 {
        format!("{}.{:01}", n_int, n_frac / 100_000)
    } else if n_int < 10_000_000 {
        format!("{}", n_int)
    } else {
        format!("{:e}", a)
    };
    format!("{}{}", sign, body)
}

// ============================================================================
// Stored day
// ============================================================================

/// Write every stored record of `sid` on the given local day. Returns the row count.
pub fn export_sensor_data_day<W: Write>(
    store: &WsnsStore,
    sid: u32,
    year: i32,
    month: u32,
    day: u32,
    mut out: W,
) -> Result<usize, ExportError> {
    let (start, end) = day_range(year, month, day)?;
    let columns = store.table_columns()?;
    let rows = store.query_raw_rows(sid, start, end)?;

    let mut header = Vec::with_capacity(columns.len() + 1);
    for (i, name) in columns.iter().enumerate() {
        match i {
            0 => header.push("ct".to_string()),
            2 => {
                header.push(name.clone());
                header.push("date".to_string());
            }
            _ => header.push(name.clone()),
        }
    }
    writeln!(out, "{}", header.join(","))?;

    for (n, row) in rows.iter().enumerate() {
        let mut line = format!("{}", n + 1);
        for (i, value) in row.iter().enumerate().skip(1) {
            line.push(',');
            match (i, value) {
                (1, Value::Integer(v)) => line.push_str(&format!("0x{:08X}", *v as u32)),
                (2, Value::Integer(v)) => {
                    line.push_str(&format!("{},{}", v, format_date(*v)));
                }
                (_, Value::Integer(v)) => line.push_str(&v.to_string()),
                (_, Value::Real(v)) => line.push_str(&format_real(*v)),
                _ => {}
            }
        }
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    tlog!("[export] sid={:08X} {:04}-{:02}-{:02}: {} rows", sid, year, month, day, rows.len());
    Ok(rows.len())
}

// ============================================================================
// View window
// ============================================================================

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// One row per visible bucket. Empty buckets are written as index-only rows.
pub fn export_view_window<W: Write>(view: &MultiResolutionView, mut out: W) -> Result<usize, ExportError> {
    writeln!(out, "{}", VIEW_COLUMNS.join(","))?;
    let padding = ",".repeat(VIEW_COLUMNS.len() - 1);

    let mut rows = 0;
    for (x, bucket) in view.visible() {
        match bucket.record() {
            Some(r) if !bucket.is_empty() => {
                let ts = view.decimated().bucket_epoch(view.pseudo_start_idx() + x);
                let fields = [
                    x.to_string(),
                    ts.to_string(),
                    format_date(ts),
                    bucket.count().to_string(),
                    format!("0x{:08X}", r.sid),
                    r.pkt_type.to_string(),
                    opt(r.value.map(format_real)),
                    opt(r.value1.map(format_real)),
                    opt(r.value2.map(format_real)),
                    opt(r.value3.map(format_real)),
                    opt(r.val_vcc_mv),
                    opt(r.lqi),
                    opt(r.val_dio.map(|d| format!("0x{:08X}", d))),
                ];
                writeln!(out, "{}", fields.join(","))?;
            }
            _ => writeln!(out, "{}{}", x, padding)?,
        }
        rows += 1;
    }
    // a window narrower than DRAW_WIDTH is padded out
    for x in rows..DRAW_WIDTH {
        writeln!(out, "{}{}", x, padding)?;
    }
    out.flush()?;
    Ok(DRAW_WIDTH.max(rows))
}

// ============================================================================
// Accelerometer trail
// ============================================================================

pub fn export_accel_trail<W: Write>(live: &LiveBuffer, sid: u32, mut out: W) -> Result<usize, ExportError> {
    writeln!(out, "{}", ACCEL_HEADER)?;
    let mut rows = 0;
    for (i, sample) in live.trail(sid).enumerate() {
        match sample {
            TrailSample::Sample(p) => writeln!(
                out,
                "{},{},{},{},{:.3},{:.3},{:.3}",
                i, p.t_pkt_ms, p.seq, p.t_ms, p.x, p.y, p.z
            )?,
            TrailSample::Placeholder => writeln!(out, "{},,,,,,", i)?,
        }
        rows += 1;
    }
    out.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{AccelPoint, Normalized};
    use crate::record::{pkt_type, SensorRecord};

    #[test]
    fn test_file_name() {
        assert_eq!(export_file_name(0x810E_E29A, 2024, 3, 7), "WSns_810EE29A_2024-03-07.csv");
    }

    #[test]
    fn test_format_real() {
        assert_eq!(format_real(0.0), "0.0");
        assert_eq!(format_real(21.5), "21.500");
        assert_eq!(format_real(-0.1234567), "-0.123457");
        assert_eq!(format_real(1234.567), "1234.56");
        assert_eq!(format_real(12345.67), "12345.6");
        assert_eq!(format_real(123456.7), "123456");
    }

    #[test]
    fn test_export_day() {
        let mut store = WsnsStore::open_in_memory().unwrap();
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 15, 0).earliest().unwrap();
        let mut r = SensorRecord::new(0x810E_E29A, pkt_type::AMB_STD).with_time(&at);
        r.value = Some(21.5);
        r.val_vcc_mv = Some(3000);
        store.insert_at(&r, &at).unwrap();
        store.insert_at(&r.clone().with_time(&(at + chrono::Duration::minutes(1))), &at).unwrap();

        let mut out = Vec::new();
        let n = export_sensor_data_day(&store, r.sid, 2024, 3, 7, &mut out).unwrap();
        assert_eq!(n, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ct,sid,ts,date,ts_msec,year,month,day,hour,lid,lqi,pkt_seq,pkt_type,value,"));
        assert!(lines[0].ends_with(",ev_src,ev_id,ev_param"));

        let cells: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(cells.len(), lines[0].split(',').count());
        assert_eq!(cells[0], "1");
        assert_eq!(cells[1], "0x810EE29A");
        assert_eq!(cells[2], at.timestamp().to_string());
        assert_eq!(cells[3], "2024/03/07 09:15:00");
        assert_eq!(cells[13], "21.500");
        assert_eq!(cells[9], ""); // lid
        assert!(lines[2].starts_with("2,0x810EE29A,"));
    }

    #[test]
    fn test_export_view_window_pads_empty_buckets() {
        let mut view = MultiResolutionView::new();
        view.set_start_epoch_and_duration(1_700_000_000, 450, DRAW_WIDTH).unwrap();
        let mut r = SensorRecord::new(5, pkt_type::MAG_STD);
        r.ts = Some(1_700_000_002);
        r.value = Some(1.0);
        view.add_entry(&r);
        view.finalize_entry();

        let mut out = Vec::new();
        assert_eq!(export_view_window(&view, &mut out).unwrap(), DRAW_WIDTH);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), DRAW_WIDTH + 1);
        assert_eq!(lines[1], "0,,,,,,,,,,,,");
        assert!(lines[3].starts_with("2,1700000002,"));
        assert!(lines[3].contains(",1,0x00000005,1,1.000,"));
    }

    #[test]
    fn test_export_accel_trail() {
        let mut live = LiveBuffer::default();
        let mut r = SensorRecord::new(9, pkt_type::MOT_STD);
        r.ts = Some(1);
        live.push(&Normalized {
            record: r,
            samples: vec![
                TrailSample::Placeholder,
                TrailSample::Sample(AccelPoint {
                    t_pkt_ms: 1000,
                    seq: 7,
                    t_ms: 1010,
                    x: 0.0106,
                    y: -1.0,
                    z: 0.25,
                }),
            ],
        });

        let mut out = Vec::new();
        assert_eq!(export_accel_trail(&live, 9, &mut out).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ACCEL_HEADER);
        assert_eq!(lines[1], "0,,,,,,");
        assert_eq!(lines[2], "1,1000,7,1010,0.011,-1.000,0.250");
    }
}
