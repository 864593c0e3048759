// src/store.rs
//
// SQLite time-series store for sensor records.
//
// One connection, one open transaction at a time. Inserts accumulate in the
// open transaction which the session commits on a fixed cadence
// (`commit_and_renew`), so up to one commit period of inserts can be lost if
// the process dies. The journal is WAL with synchronous=NORMAL.
//
// Every query collects its rows before handing them to the caller's handler,
// so no statement is still stepping when the handler runs.

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::record::{Calendar, SensorRecord};

pub const DEFAULT_COMMIT_PERIOD: Duration = Duration::from_secs(10);
/// Row cap of `QueryMode::RandomSample`.
pub const RANDOM_SAMPLE_LIMIT: usize = 512;
/// 9999-12-31 23:59:59 UTC, upper bound of `query_next_ts`.
pub const TS_UPPER_BOUND: i64 = 253_402_300_799;
const NO_DESC: &str = "-no desc--";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS sensor_node (
    sid INTEGER PRIMARY KEY,
    sid_text TEXT,
    desc TEXT
);

CREATE TABLE IF NOT EXISTS sensor_last (
    sid INTEGER PRIMARY KEY,
    ts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sensor_data (
    _uqid INTEGER PRIMARY KEY AUTOINCREMENT,
    sid INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    ts_msec INTEGER NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    hour INTEGER NOT NULL,
    lid INTEGER,
    lqi INTEGER,
    pkt_seq INTEGER,
    pkt_type INTEGER NOT NULL,
    value REAL,
    value1 REAL,
    value2 REAL,
    value3 REAL,
    val_vcc_mv INTEGER,
    val_dio INTEGER,
    val_adc1_mv INTEGER,
    val_adc2_mv INTEGER,
    val_aux INTEGER,
    ev_src INTEGER,
    ev_id INTEGER,
    ev_param INTEGER
);

CREATE INDEX IF NOT EXISTS idx_ts ON sensor_data (sid, ts);
";

const PRAGMA_SQL: &str = "
PRAGMA main.page_size = 4096;
PRAGMA main.cache_size = 10000;
PRAGMA main.synchronous = NORMAL;
PRAGMA main.journal_mode = WAL;
PRAGMA main.temp_store = MEMORY;
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Unordered,
    /// Ascending by `ts`.
    Ordered,
    /// Random order, at most `RANDOM_SAMPLE_LIMIT` rows.
    RandomSample,
}

impl QueryMode {
    fn sql(self) -> &'static str {
        match self {
            QueryMode::Unordered => "SELECT * FROM sensor_data WHERE sid = ?1 AND ts BETWEEN ?2 AND ?3",
            QueryMode::Ordered => {
                "SELECT * FROM sensor_data WHERE sid = ?1 AND ts BETWEEN ?2 AND ?3 ORDER BY ts ASC"
            }
            QueryMode::RandomSample => {
                "SELECT * FROM sensor_data WHERE sid = ?1 AND ts BETWEEN ?2 AND ?3 ORDER BY random() LIMIT 512"
            }
        }
    }
}

// ============================================================================
// Local calendar helpers
// ============================================================================

/// Epoch of `date` at `hour:00:00` in `tz`, `None` inside a DST gap.
fn epoch_in<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32) -> Option<i64> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    tz.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp())
}

/// Epoch of `date` at `hour:00:00` local time, `None` inside a DST gap.
fn local_epoch(date: NaiveDate, hour: u32) -> Option<i64> {
    epoch_in(&Local, date, hour)
}

/// `(hour, start, end)` for every local hour of `date` that exists in `tz`.
/// An hour runs until the next existing hour starts, so a repeated hour on a
/// DST fall-back day spans both passes.
fn hour_ranges<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Vec<(u32, i64, i64)> {
    let starts: Vec<(u32, i64)> = (0..24)
        .filter_map(|h| epoch_in(tz, date, h).map(|t| (h, t)))
        .collect();
    let next_day = date
        .succ_opt()
        .and_then(|next| (0..3).find_map(|h| epoch_in(tz, next, h)));

    starts
        .iter()
        .enumerate()
        .filter_map(|(i, &(hour, start))| {
            let next = starts.get(i + 1).map(|&(_, t)| t).or(next_day)?;
            Some((hour, start, next - 1))
        })
        .collect()
}

/// First existing local instant of `date`.
fn day_start(date: NaiveDate) -> Option<i64> {
    (0..3).find_map(|h| local_epoch(date, h))
}

fn date(year: i32, month: u32, day: u32) -> StoreResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| StoreError::Calendar(format!("{:04}-{:02}-{:02}", year, month, day)))
}

/// `[start, end]` epoch range between two local dates.
fn date_range(from: NaiveDate, until: NaiveDate) -> StoreResult<(i64, i64)> {
    let start = day_start(from).ok_or_else(|| StoreError::Calendar(from.to_string()))?;
    let next = day_start(until).ok_or_else(|| StoreError::Calendar(until.to_string()))?;
    Ok((start, next - 1))
}

/// Epoch range of one local calendar day.
pub fn day_range(year: i32, month: u32, day: u32) -> StoreResult<(i64, i64)> {
    let d = date(year, month, day)?;
    let next = d
        .succ_opt()
        .ok_or_else(|| StoreError::Calendar(d.to_string()))?;
    date_range(d, next)
}

fn month_range(year: i32, month: u32) -> StoreResult<(i64, i64)> {
    let first = date(year, month, 1)?;
    let next = if month == 12 {
        date(year + 1, 1, 1)?
    } else {
        date(year, month + 1, 1)?
    };
    date_range(first, next)
}

fn year_range(year: i32) -> StoreResult<(i64, i64)> {
    date_range(date(year, 1, 1)?, date(year + 1, 1, 1)?)
}

fn log_failure(op: &'static str) -> impl FnOnce(StoreError) -> StoreError {
    move |e| {
        tlog!("[store] {} failed: {}", op, e);
        e
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<SensorRecord> {
    Ok(SensorRecord {
        sid: row.get::<_, i64>("sid")? as u32,
        ts: row.get("ts")?,
        ts_msec: row.get::<_, i64>("ts_msec")? as u16,
        lid: row.get::<_, Option<i64>>("lid")?.map(|v| v as u8),
        lqi: row.get::<_, Option<i64>>("lqi")?.map(|v| v as u8),
        pkt_seq: row.get::<_, Option<i64>>("pkt_seq")?.map(|v| v as u16),
        pkt_type: row.get::<_, i64>("pkt_type")? as u16,
        value: row.get("value")?,
        value1: row.get("value1")?,
        value2: row.get("value2")?,
        value3: row.get("value3")?,
        val_vcc_mv: row.get("val_vcc_mv")?,
        val_dio: row.get::<_, Option<i64>>("val_dio")?.map(|v| v as u32),
        val_adc1_mv: row.get("val_adc1_mv")?,
        val_adc2_mv: row.get("val_adc2_mv")?,
        val_aux: row.get("val_aux")?,
        ev_src: row.get::<_, Option<i64>>("ev_src")?.map(|v| v as u8),
        ev_id: row.get::<_, Option<i64>>("ev_id")?.map(|v| v as u8),
        ev_param: row.get::<_, Option<i64>>("ev_param")?.map(|v| v as u32),
    })
}

// ============================================================================
// Commit cadence
// ============================================================================

/// Decides when the open transaction is committed and renewed.
#[derive(Debug, Clone)]
pub struct CommitCadence {
    period: Duration,
    last: Option<DateTime<Local>>,
}

impl Default for CommitCadence {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_PERIOD)
    }
}

impl CommitCadence {
    pub fn new(period: Duration) -> Self {
        CommitCadence { period, last: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// True when a full period has passed since the last commit. The first
    /// call only starts the clock.
    pub fn due(&mut self, now: &DateTime<Local>) -> bool {
        match self.last {
            None => {
                self.last = Some(*now);
                false
            }
            Some(last) => {
                let elapsed = now.signed_duration_since(last).num_milliseconds();
                if elapsed >= self.period.as_millis() as i64 {
                    self.last = Some(*now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct WsnsStore {
    conn: Connection,
    path: Option<PathBuf>,
    /// SIDs known to have a `sensor_node` row.
    node_seen: HashSet<u32>,
}

impl WsnsStore {
    /// Open (or create) the database at `path` and prepare the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| log_failure("open")(e.into()))?;
        let store = Self::with_connection(conn, Some(path.to_path_buf()))?;
        tlog!("[store] Opened {:?}", path);
        Ok(store)
    }

    /// Private in-memory database (nothing survives the store).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        let mut store = WsnsStore {
            conn,
            path,
            node_seen: HashSet::new(),
        };
        store.prepare_tables().map_err(log_failure("prepare_tables"))?;
        store.load_node_seen()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply the connection PRAGMAs and create tables and index if missing.
    /// Safe to call repeatedly.
    pub fn prepare_tables(&self) -> StoreResult<()> {
        // page_size only takes effect before the first table exists
        self.conn.execute_batch(PRAGMA_SQL)?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn load_node_seen(&mut self) -> StoreResult<()> {
        let mut stmt = self.conn.prepare_cached("SELECT sid FROM sensor_node")?;
        let sids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        self.node_seen = sids.into_iter().map(|s| s as u32).collect();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Open a transaction unless one is already open.
    pub fn begin(&mut self) -> StoreResult<()> {
        if !self.in_transaction() {
            self.conn
                .execute_batch("BEGIN")
                .map_err(|e| log_failure("begin")(e.into()))?;
        }
        Ok(())
    }

    /// Commit the open transaction, if any.
    pub fn commit(&mut self) -> StoreResult<()> {
        if self.in_transaction() {
            self.conn
                .execute_batch("COMMIT")
                .map_err(|e| log_failure("commit")(e.into()))?;
        }
        Ok(())
    }

    /// Commit and immediately open the next transaction.
    pub fn commit_and_renew(&mut self) -> StoreResult<()> {
        self.commit()?;
        self.begin()
    }

    /// Commit whatever is pending and close the connection.
    pub fn close(mut self) -> StoreResult<()> {
        self.commit()?;
        let conn = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        conn.close().map_err(|(_, e)| log_failure("close")(e.into()))?;
        tlog!("[store] Closed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Append a record. `sensor_last` receives the current wall-clock time,
    /// not the record's timestamp.
    pub fn insert(&mut self, record: &SensorRecord) -> StoreResult<i64> {
        self.insert_at(record, &Local::now())
    }

    /// `insert` with an explicit wall clock.
    pub fn insert_at(&mut self, record: &SensorRecord, wall_clock: &DateTime<Local>) -> StoreResult<i64> {
        self.try_insert(record, wall_clock)
            .map_err(log_failure("insert"))
    }

    fn try_insert(&mut self, record: &SensorRecord, wall_clock: &DateTime<Local>) -> StoreResult<i64> {
        let ts = record.ts.unwrap_or_else(|| wall_clock.timestamp());
        let cal = Calendar::from_epoch(ts)
            .ok_or_else(|| StoreError::Calendar(format!("epoch {}", ts)))?;

        let rowid = {
            let mut stmt = self.conn.prepare_cached(
                "INSERT INTO sensor_data (sid, ts, ts_msec, year, month, day, hour, lid, lqi, pkt_seq, pkt_type,
                    value, value1, value2, value3, val_vcc_mv, val_dio, val_adc1_mv, val_adc2_mv, val_aux,
                    ev_src, ev_id, ev_param)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            )?;
            stmt.insert(params![
                i64::from(record.sid),
                ts,
                i64::from(record.ts_msec),
                cal.year,
                cal.month,
                cal.day,
                cal.hour,
                record.lid,
                record.lqi,
                record.pkt_seq,
                record.pkt_type,
                record.value,
                record.value1,
                record.value2,
                record.value3,
                record.val_vcc_mv,
                record.val_dio.map(i64::from),
                record.val_adc1_mv,
                record.val_adc2_mv,
                record.val_aux,
                record.ev_src,
                record.ev_id,
                record.ev_param.map(i64::from),
            ])?
        };

        self.conn
            .prepare_cached("REPLACE INTO sensor_last (sid, ts) VALUES (?1, ?2)")?
            .execute(params![i64::from(record.sid), wall_clock.timestamp()])?;

        if !self.node_seen.contains(&record.sid) {
            self.conn
                .prepare_cached("INSERT OR IGNORE INTO sensor_node (sid, sid_text, desc) VALUES (?1, ?2, ?3)")?
                .execute(params![
                    i64::from(record.sid),
                    format!("{:08X}", record.sid),
                    NO_DESC
                ])?;
            self.node_seen.insert(record.sid);
        }

        Ok(rowid)
    }

    /// Register or rename a node.
    pub fn sensor_node_add(&mut self, sid: u32, desc: Option<&str>) -> StoreResult<()> {
        self.conn
            .prepare_cached("REPLACE INTO sensor_node (sid, sid_text, desc) VALUES (?1, ?2, ?3)")
            .and_then(|mut stmt| {
                stmt.execute(params![
                    i64::from(sid),
                    format!("{:08X}", sid),
                    desc.unwrap_or(NO_DESC)
                ])
            })
            .map_err(|e| log_failure("sensor_node_add")(e.into()))?;
        self.node_seen.insert(sid);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Range queries
    // ------------------------------------------------------------------------

    fn collect(&self, sql: &str, sid: u32, t_start: i64, t_end: i64) -> StoreResult<Vec<SensorRecord>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![i64::from(sid), t_start, t_end], row_to_record)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Records of `sid` with `t_start <= ts <= t_end`, delivered to `handler`.
    /// Returns the number delivered.
    pub fn query_sensor_data<F>(
        &self,
        sid: u32,
        t_start: i64,
        t_end: i64,
        mode: QueryMode,
        mut handler: F,
    ) -> StoreResult<usize>
    where
        F: FnMut(SensorRecord),
    {
        let records = self
            .collect(mode.sql(), sid, t_start, t_end)
            .map_err(log_failure("query_sensor_data"))?;
        let count = records.len();
        records.into_iter().for_each(&mut handler);
        Ok(count)
    }

    pub fn query_sensor_data_by_day<F>(&self, sid: u32, year: i32, month: u32, day: u32, handler: F) -> StoreResult<usize>
    where
        F: FnMut(SensorRecord),
    {
        let (start, end) = day_range(year, month, day)?;
        self.query_sensor_data(sid, start, end, QueryMode::Ordered, handler)
    }

    pub fn query_sensor_data_by_hour<F>(
        &self,
        sid: u32,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        handler: F,
    ) -> StoreResult<usize>
    where
        F: FnMut(SensorRecord),
    {
        let (_, start, end) = hour_ranges(&Local, date(year, month, day)?)
            .into_iter()
            .find(|&(h, _, _)| h == hour)
            .ok_or_else(|| StoreError::Calendar(format!("{:04}-{:02}-{:02} {:02}h", year, month, day, hour)))?;
        self.query_sensor_data(sid, start, end, QueryMode::Ordered, handler)
    }

    /// Column names of `sensor_data` in table order.
    pub fn table_columns(&self) -> StoreResult<Vec<String>> {
        let columns = (|| -> StoreResult<Vec<String>> {
            let mut stmt = self.conn.prepare_cached("PRAGMA table_info(sensor_data)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })()
        .map_err(log_failure("table_columns"))?;
        Ok(columns)
    }

    /// Raw `sensor_data` rows of `sid` in `[t_start, t_end]`, ascending by `ts`,
    /// every column in table order.
    pub fn query_raw_rows(&self, sid: u32, t_start: i64, t_end: i64) -> StoreResult<Vec<Vec<Value>>> {
        let rows = (|| -> StoreResult<Vec<Vec<Value>>> {
            let mut stmt = self.conn.prepare_cached(QueryMode::Ordered.sql())?;
            let n = stmt.column_count();
            let rows = stmt.query_map(params![i64::from(sid), t_start, t_end], |row| {
                (0..n).map(|i| row.get::<_, Value>(i)).collect()
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })()
        .map_err(log_failure("query_raw_rows"))?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Bounds and neighbours
    // ------------------------------------------------------------------------

    fn scalar_ts(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Option<i64>> {
        let value = self
            .conn
            .prepare_cached(sql)?
            .query_row(params, |row| row.get::<_, Option<i64>>(0))
            .optional()?;
        Ok(value.flatten())
    }

    fn min_max_ts(&self, sid: u32) -> StoreResult<(Option<i64>, Option<i64>)> {
        // Two statements: MIN and MAX together defeat the index.
        let min = self.scalar_ts("SELECT MIN(ts) FROM sensor_data WHERE sid = ?1", params![i64::from(sid)])?;
        let max = self.scalar_ts("SELECT MAX(ts) FROM sensor_data WHERE sid = ?1", params![i64::from(sid)])?;
        Ok((min, max))
    }

    /// Oldest and newest `ts` of `sid`; `NoData` when the device has no rows.
    pub fn query_oldest_and_newest(&self, sid: u32) -> StoreResult<(i64, i64)> {
        match self.min_max_ts(sid).map_err(log_failure("query_oldest_and_newest"))? {
            (Some(oldest), Some(newest)) => Ok((oldest, newest)),
            _ => Err(StoreError::NoData(sid)),
        }
    }

    /// Nearest `ts` strictly before `ts_ref`.
    pub fn query_previous_ts(&self, sid: u32, ts_ref: i64) -> StoreResult<Option<i64>> {
        self.scalar_ts(
            "SELECT MAX(ts) FROM sensor_data WHERE sid = ?1 AND ts BETWEEN 0 AND ?2",
            params![i64::from(sid), ts_ref - 1],
        )
        .map_err(log_failure("query_previous_ts"))
    }

    /// Nearest `ts` strictly after `ts_ref`.
    pub fn query_next_ts(&self, sid: u32, ts_ref: i64) -> StoreResult<Option<i64>> {
        self.scalar_ts(
            "SELECT MIN(ts) FROM sensor_data WHERE sid = ?1 AND ts BETWEEN ?2 AND ?3",
            params![i64::from(sid), ts_ref + 1, TS_UPPER_BOUND],
        )
        .map_err(log_failure("query_next_ts"))
    }

    /// Wall-clock time of the last insert for `sid`.
    pub fn query_latest_ts(&self, sid: u32) -> StoreResult<Option<i64>> {
        self.scalar_ts("SELECT ts FROM sensor_last WHERE sid = ?1", params![i64::from(sid)])
            .map_err(log_failure("query_latest_ts"))
    }

    /// `(sid, last_seen)` of every device, most recent first.
    pub fn query_sorted_sensor_list_newer_first(&self) -> StoreResult<Vec<(u32, i64)>> {
        let list = (|| -> StoreResult<Vec<(u32, i64)>> {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT sid, ts FROM sensor_last ORDER BY ts DESC")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })()
        .map_err(log_failure("query_sorted_sensor_list_newer_first"))?;
        Ok(list)
    }

    /// Description stored for `sid` in `sensor_node`.
    pub fn query_sid_string(&self, sid: u32) -> StoreResult<Option<String>> {
        let desc = self
            .conn
            .prepare_cached("SELECT desc FROM sensor_node WHERE sid = ?1")?
            .query_row(params![i64::from(sid)], |row| row.get::<_, Option<String>>(0))
            .optional()
            .map_err(|e| log_failure("query_sid_string")(e.into()))?;
        Ok(desc.flatten())
    }

    // ------------------------------------------------------------------------
    // Calendar discovery
    // ------------------------------------------------------------------------

    fn has_data(&self, sid: u32, start: i64, end: i64) -> StoreResult<bool> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM sensor_data WHERE sid = ?1 AND ts BETWEEN ?2 AND ?3 LIMIT 1")?
            .query_row(params![i64::from(sid), start, end], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Years with data for `sid`, ascending. The first and last years come
    /// from MIN/MAX, the ones in between are checked one by one.
    pub fn query_recorded_years_of_sensor_data(&self, sid: u32) -> StoreResult<Vec<i32>> {
        let (oldest, newest) = self.query_oldest_and_newest(sid)?;
        let year_of = |ts: i64| {
            Calendar::from_epoch(ts)
                .map(|c| c.year)
                .ok_or_else(|| StoreError::Calendar(format!("epoch {}", ts)))
        };
        let (first, last) = (year_of(oldest)?, year_of(newest)?);

        let mut years = vec![first];
        for year in first + 1..last {
            let (start, end) = year_range(year)?;
            if self.has_data(sid, start, end).map_err(log_failure("query_recorded_years"))? {
                years.push(year);
            }
        }
        if last != first {
            years.push(last);
        }
        Ok(years)
    }

    pub fn query_recorded_months_of_sensor_data(&self, sid: u32, year: i32) -> StoreResult<Vec<u32>> {
        let mut months = Vec::new();
        for month in 1..=12 {
            let (start, end) = month_range(year, month)?;
            if self.has_data(sid, start, end).map_err(log_failure("query_recorded_months"))? {
                months.push(month);
            }
        }
        Ok(months)
    }

    pub fn query_recorded_days_of_sensor_data(&self, sid: u32, year: i32, month: u32) -> StoreResult<Vec<u32>> {
        let first = date(year, month, 1)?;
        let mut days = Vec::new();
        let mut d = first;
        while d.month() == month {
            let (start, end) = day_range(d.year(), d.month(), d.day())?;
            if self.has_data(sid, start, end).map_err(log_failure("query_recorded_days"))? {
                days.push(d.day());
            }
            match d.succ_opt() {
                Some(next) => d = next,
                None => break,
            }
        }
        Ok(days)
    }

    pub fn query_recorded_hours_of_sensor_data(
        &self,
        sid: u32,
        year: i32,
        month: u32,
        day: u32,
    ) -> StoreResult<Vec<u32>> {
        let d = date(year, month, day)?;
        let mut hours = Vec::new();
        // hours skipped by a DST change have no range and no data
        for (hour, start, end) in hour_ranges(&Local, d) {
            if self
                .has_data(sid, start, end)
                .map_err(log_failure("query_recorded_hours"))?
            {
                hours.push(hour);
            }
        }
        Ok(hours)
    }
}

impl Drop for WsnsStore {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                tlog!("[store] Commit on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::pkt_type;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).earliest().unwrap()
    }

    fn record(sid: u32, at: &DateTime<Local>) -> SensorRecord {
        let mut r = SensorRecord::new(sid, pkt_type::AMB_STD).with_time(at);
        r.lqi = Some(120);
        r.value = Some(21.5);
        r.value1 = Some(40.25);
        r.val_vcc_mv = Some(3000);
        r
    }

    fn temp_store() -> (tempfile::TempDir, WsnsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = WsnsStore::open(&dir.path().join("wsns.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_commit_query_round_trip() {
        let (_dir, mut store) = temp_store();
        let at = local(2024, 5, 1, 12, 30);
        let mut r = record(0x810E_E29A, &at);
        r.val_dio = Some(0x9100_0000);
        r.ev_param = Some(0x00FF_FFFF);
        r.pkt_seq = Some(0xFFFF);

        store.begin().unwrap();
        store.insert_at(&r, &at).unwrap();
        store.commit().unwrap();

        let ts = r.ts.unwrap();
        let mut got = Vec::new();
        let n = store
            .query_sensor_data(r.sid, ts, ts, QueryMode::Ordered, |x| got.push(x))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(got, vec![r]);
    }

    #[test]
    fn test_prepare_tables_is_idempotent() {
        let (dir, store) = temp_store();
        store.prepare_tables().unwrap();
        store.prepare_tables().unwrap();
        drop(store);
        WsnsStore::open(&dir.path().join("wsns.sqlite")).unwrap();
    }

    #[test]
    fn test_transaction_cadence() {
        let (_dir, mut store) = temp_store();
        assert!(!store.in_transaction());
        store.begin().unwrap();
        store.begin().unwrap();
        assert!(store.in_transaction());
        store.commit_and_renew().unwrap();
        assert!(store.in_transaction());
        store.commit().unwrap();
        assert!(!store.in_transaction());
        store.commit().unwrap();
    }

    #[test]
    fn test_uncommitted_rows_survive_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsns.sqlite");
        let at = local(2024, 5, 1, 8, 0);
        {
            let mut store = WsnsStore::open(&path).unwrap();
            store.begin().unwrap();
            store.insert_at(&record(1, &at), &at).unwrap();
            store.close().unwrap();
        }
        let store = WsnsStore::open(&path).unwrap();
        assert_eq!(store.query_oldest_and_newest(1).unwrap(), (at.timestamp(), at.timestamp()));
    }

    #[test]
    fn test_reopened_file_keeps_rows_and_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wsns.sqlite");
        let at = local(2024, 9, 14, 18, 45);
        {
            let mut store = WsnsStore::open(&path).unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
            store.begin().unwrap();
            store.insert_at(&record(0x8201_0002, &at), &at).unwrap();
            store.insert_at(&record(0x8201_0002, &(at + chrono::Duration::seconds(5))), &at).unwrap();
            store.commit().unwrap();
        }

        let store = WsnsStore::open(&path).unwrap();
        let mut got = Vec::new();
        store
            .query_sensor_data_by_day(0x8201_0002, 2024, 9, 14, |r| got.push(r))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], record(0x8201_0002, &at));
        assert_eq!(store.query_sid_string(0x8201_0002).unwrap().as_deref(), Some("-no desc--"));

        let page_size: i64 = store.conn.query_row("PRAGMA page_size", [], |r| r.get(0)).unwrap();
        assert_eq!(page_size, 4096);
        let mode: String = store.conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_hour_ranges_follow_dst_changes() {
        use chrono_tz::America::New_York;

        // fall back: 01:00-01:59 happens twice, 05:00Z to 06:59:59Z
        let fall = NaiveDate::from_ymd_opt(2024, 11, 3).unwrap();
        let ranges = hour_ranges(&New_York, fall);
        assert_eq!(ranges.len(), 24);
        let one_am = Utc.with_ymd_and_hms(2024, 11, 3, 5, 0, 0).unwrap().timestamp();
        assert_eq!(ranges[1], (1, one_am, one_am + 7200 - 1));
        assert_eq!(ranges[2].1, one_am + 7200);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].2 + 1, pair[1].1);
        }

        // spring forward: 02:00 does not exist, 01:00 lasts one hour
        let spring = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let ranges = hour_ranges(&New_York, spring);
        assert_eq!(ranges.len(), 23);
        assert!(ranges.iter().all(|&(h, _, _)| h != 2));
        let one_am = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap().timestamp();
        assert_eq!(ranges[1], (1, one_am, one_am + 3600 - 1));
        assert_eq!(ranges[2], (3, one_am + 3600, one_am + 7200 - 1));

        // last hour ends where the next day begins
        let next = Utc.with_ymd_and_hms(2024, 3, 11, 4, 0, 0).unwrap().timestamp();
        assert_eq!(ranges.last().unwrap().2, next - 1);
    }

    #[test]
    fn test_sensor_last_uses_wall_clock() {
        let (_dir, mut store) = temp_store();
        let sampled = local(2023, 1, 1, 0, 0);
        let received = local(2024, 6, 1, 0, 0);
        store.insert_at(&record(9, &sampled), &received).unwrap();

        assert_eq!(store.query_latest_ts(9).unwrap(), Some(received.timestamp()));
        assert_eq!(store.query_latest_ts(10).unwrap(), None);
    }

    #[test]
    fn test_sensor_list_newer_first_and_nodes() {
        let (_dir, mut store) = temp_store();
        let t0 = local(2024, 1, 1, 0, 0);
        store.insert_at(&record(1, &t0), &t0).unwrap();
        store.insert_at(&record(2, &t0), &local(2024, 1, 3, 0, 0)).unwrap();
        store.insert_at(&record(3, &t0), &local(2024, 1, 2, 0, 0)).unwrap();

        let sids: Vec<u32> = store
            .query_sorted_sensor_list_newer_first()
            .unwrap()
            .into_iter()
            .map(|(sid, _)| sid)
            .collect();
        assert_eq!(sids, vec![2, 3, 1]);

        assert_eq!(store.query_sid_string(1).unwrap().as_deref(), Some("-no desc--"));
        store.sensor_node_add(1, Some("greenhouse")).unwrap();
        assert_eq!(store.query_sid_string(1).unwrap().as_deref(), Some("greenhouse"));
        assert_eq!(store.query_sid_string(99).unwrap(), None);
    }

    #[test]
    fn test_three_days_listed_ascending() {
        let (_dir, mut store) = temp_store();
        let sid = 0x8201_0001;
        let days = [(2024, 3, 12), (2024, 3, 3), (2024, 3, 27)];
        store.begin().unwrap();
        for i in 0..100u32 {
            let (y, m, d) = days[(i % 3) as usize];
            let at = local(y, m, d, i % 24, i % 60);
            store.insert_at(&record(sid, &at), &at).unwrap();
        }
        store.commit().unwrap();

        assert_eq!(store.query_recorded_days_of_sensor_data(sid, 2024, 3).unwrap(), vec![3, 12, 27]);
        assert_eq!(store.query_recorded_months_of_sensor_data(sid, 2024).unwrap(), vec![3]);
        assert_eq!(store.query_recorded_years_of_sensor_data(sid).unwrap(), vec![2024]);

        let mut count = 0;
        store
            .query_sensor_data_by_day(sid, 2024, 3, 12, |_| count += 1)
            .unwrap();
        assert_eq!(count, 34);
    }

    #[test]
    fn test_recorded_years_skip_empty_years() {
        let (_dir, mut store) = temp_store();
        for y in [2019, 2021, 2024] {
            let at = local(y, 7, 1, 12, 0);
            store.insert_at(&record(4, &at), &at).unwrap();
        }
        assert_eq!(
            store.query_recorded_years_of_sensor_data(4).unwrap(),
            vec![2019, 2021, 2024]
        );
        assert!(matches!(
            store.query_recorded_years_of_sensor_data(5),
            Err(StoreError::NoData(5))
        ));
    }

    #[test]
    fn test_hours_and_hour_query() {
        let (_dir, mut store) = temp_store();
        for (h, m) in [(0, 0), (0, 59), (13, 1), (23, 59)] {
            let at = local(2024, 2, 29, h, m);
            store.insert_at(&record(6, &at), &at).unwrap();
        }
        assert_eq!(
            store.query_recorded_hours_of_sensor_data(6, 2024, 2, 29).unwrap(),
            vec![0, 13, 23]
        );
        let mut count = 0;
        store
            .query_sensor_data_by_hour(6, 2024, 2, 29, 0, |_| count += 1)
            .unwrap();
        assert_eq!(count, 2);
        assert!(matches!(
            store.query_recorded_hours_of_sensor_data(6, 2023, 2, 29),
            Err(StoreError::Calendar(_))
        ));
    }

    #[test]
    fn test_previous_next_and_bounds() {
        let (_dir, mut store) = temp_store();
        let base = local(2024, 4, 10, 9, 0).timestamp();
        for off in [0, 60, 600] {
            let at = Local.timestamp_opt(base + off, 0).unwrap();
            store.insert_at(&record(8, &at), &at).unwrap();
        }
        assert_eq!(store.query_previous_ts(8, base + 60).unwrap(), Some(base));
        assert_eq!(store.query_previous_ts(8, base).unwrap(), None);
        assert_eq!(store.query_next_ts(8, base).unwrap(), Some(base + 60));
        assert_eq!(store.query_next_ts(8, base + 600).unwrap(), None);
        assert_eq!(store.query_oldest_and_newest(8).unwrap(), (base, base + 600));
        assert!(matches!(store.query_oldest_and_newest(7), Err(StoreError::NoData(7))));
    }

    #[test]
    fn test_random_sample_is_capped() {
        let mut store = WsnsStore::open_in_memory().unwrap();
        let base = local(2024, 8, 1, 0, 0).timestamp();
        store.begin().unwrap();
        for i in 0..600 {
            let at = Local.timestamp_opt(base + i, 0).unwrap();
            store.insert_at(&record(3, &at), &at).unwrap();
        }
        store.commit().unwrap();

        let mut seen = BTreeSet::new();
        let n = store
            .query_sensor_data(3, base, base + 599, QueryMode::RandomSample, |r| {
                seen.insert(r.ts.unwrap());
            })
            .unwrap();
        assert_eq!(n, RANDOM_SAMPLE_LIMIT);
        assert_eq!(seen.len(), RANDOM_SAMPLE_LIMIT);

        let mut ordered = Vec::new();
        store
            .query_sensor_data(3, base, base + 599, QueryMode::Ordered, |r| ordered.push(r.ts.unwrap()))
            .unwrap();
        assert_eq!(ordered.len(), 600);
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_commit_cadence() {
        let mut cadence = CommitCadence::default();
        let t0 = local(2024, 1, 1, 0, 0);
        assert!(!cadence.due(&t0));
        assert!(!cadence.due(&(t0 + chrono::Duration::seconds(9))));
        assert!(cadence.due(&(t0 + chrono::Duration::seconds(10))));
        assert!(!cadence.due(&(t0 + chrono::Duration::seconds(15))));
        assert!(cadence.due(&(t0 + chrono::Duration::seconds(21))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_calendar_discovery_matches_brute_force(
            offsets in prop::collection::vec(0i64..(3 * 366 * 86400), 1..40)
        ) {
            let mut store = WsnsStore::open_in_memory().unwrap();
            let base = local(2022, 1, 1, 0, 0).timestamp();
            let mut cals = Vec::new();
            for off in &offsets {
                let at = Local.timestamp_opt(base + off, 0).unwrap();
                store.insert_at(&record(11, &at), &at).unwrap();
                cals.push(Calendar::from_datetime(&at));
            }

            let years: BTreeSet<i32> = cals.iter().map(|c| c.year).collect();
            prop_assert_eq!(
                store.query_recorded_years_of_sensor_data(11).unwrap(),
                years.iter().copied().collect::<Vec<_>>()
            );

            let c = cals[0];
            let months: BTreeSet<u32> = cals.iter().filter(|x| x.year == c.year).map(|x| x.month).collect();
            prop_assert_eq!(
                store.query_recorded_months_of_sensor_data(11, c.year).unwrap(),
                months.into_iter().collect::<Vec<_>>()
            );

            let days: BTreeSet<u32> = cals
                .iter()
                .filter(|x| x.year == c.year && x.month == c.month)
                .map(|x| x.day)
                .collect();
            prop_assert_eq!(
                store.query_recorded_days_of_sensor_data(11, c.year, c.month).unwrap(),
                days.into_iter().collect::<Vec<_>>()
            );

            let hours: BTreeSet<u32> = cals
                .iter()
                .filter(|x| x.year == c.year && x.month == c.month && x.day == c.day)
                .map(|x| x.hour)
                .collect();
            prop_assert_eq!(
                store.query_recorded_hours_of_sensor_data(11, c.year, c.month, c.day).unwrap(),
                hours.into_iter().collect::<Vec<_>>()
            );
        }
    }
}
