// src/session.rs
//
// One ingest/view session: owns the framer, normaliser, store, live buffer
// and view, and drives them from raw bytes and user actions.
//
// Everything runs on the caller's thread. Store queries collect their rows
// before returning, so no cursor is open while the view is being filled.

use chrono::{DateTime, Local};
use std::time::Duration;

use crate::error::{ClassifyError, StoreResult};
use crate::io::serial::AsciiFramer;
use crate::io::ByteSource;
use crate::live_buffer::LiveBuffer;
use crate::normalizer::Normalizer;
use crate::packet;
use crate::record::{Calendar, SensorRecord};
use crate::settings::WsnsSettings;
use crate::store::{day_range, CommitCadence, QueryMode, WsnsStore};
use crate::view::{MultiResolutionView, DATA_WIDTH, DRAW_WIDTH, LIVE_VIEW_DUR};

const DAY_SECS: i64 = DATA_WIDTH as i64;
const READ_CHUNK: usize = 1024;

/// Receives the view each time its display buffer has been finalised.
pub trait RenderSink {
    fn render(&mut self, view: &MultiResolutionView);
}

impl<F: FnMut(&MultiResolutionView)> RenderSink for F {
    fn render(&mut self, view: &MultiResolutionView) {
        self(view)
    }
}

/// Sink that discards every frame.
pub struct NullSink;

impl RenderSink for NullSink {
    fn render(&mut self, _view: &MultiResolutionView) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Last LIVE_VIEW_DUR seconds from the live buffer.
    Live,
    /// Random sample of one day, scale 1 only.
    Preview,
    /// One stored day at full resolution.
    Day,
}

pub struct Session {
    framer: AsciiFramer,
    normalizer: Normalizer,
    store: Option<WsnsStore>,
    live: LiveBuffer,
    view: MultiResolutionView,
    node: Option<u32>,
    mode: ViewMode,
    cadence: CommitCadence,
    store_failures: u64,
}

impl Session {
    /// Build a session around an optional store. Without a store records are
    /// only kept live.
    pub fn new(store: Option<WsnsStore>, live_capacity: usize, commit_period: Duration) -> Self {
        let mut store = store;
        if let Some(s) = store.as_mut() {
            if let Err(e) = s.begin() {
                tlog!("[session] Could not open a transaction: {}", e);
            }
        }
        Session {
            framer: AsciiFramer::new(),
            normalizer: Normalizer::new(),
            store,
            live: LiveBuffer::new(live_capacity),
            view: MultiResolutionView::new(),
            node: None,
            mode: ViewMode::Live,
            cadence: CommitCadence::new(commit_period),
            store_failures: 0,
        }
    }

    /// Open the configured database. A store that fails to open is logged and
    /// the session runs without persistence.
    pub fn open(settings: &WsnsSettings) -> Self {
        let store = match WsnsStore::open(&settings.db_path) {
            Ok(s) => Some(s),
            Err(e) => {
                tlog!("[session] Store unavailable ({}): {}", settings.db_path.display(), e);
                None
            }
        };
        Self::new(
            store,
            settings.live_capacity,
            Duration::from_secs(settings.commit_period_secs),
        )
    }

    pub fn store(&self) -> Option<&WsnsStore> {
        self.store.as_ref()
    }

    pub fn live(&self) -> &LiveBuffer {
        &self.live
    }

    pub fn view(&self) -> &MultiResolutionView {
        &self.view
    }

    pub fn node(&self) -> Option<u32> {
        self.node
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Records that reached the live buffer but could not be written.
    pub fn store_failures(&self) -> u64 {
        self.store_failures
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Run raw serial bytes through the pipeline. Returns the records produced.
    pub fn ingest(&mut self, bytes: &[u8], now: &DateTime<Local>) -> Vec<SensorRecord> {
        let mut produced = Vec::new();

        for frame in self.framer.feed(bytes) {
            let payload = match frame {
                Ok(p) => p,
                Err(e) => {
                    tlog!("[framer] Dropped frame: {}", e);
                    continue;
                }
            };
            let packet = match packet::decode(&payload) {
                Ok(p) => p,
                Err(e) => {
                    tlog!("[session] Discarded payload: {}", e);
                    continue;
                }
            };
            let normalized = match self.normalizer.normalize(&packet, now) {
                Ok(n) => n,
                Err(ClassifyError::NoRecord(kind)) => {
                    tlog!("[session] {} from {:08X}, no record", kind, packet.src_addr());
                    continue;
                }
                Err(e) => {
                    tlog!("[session] Normalize failed: {}", e);
                    continue;
                }
            };

            self.live.push(&normalized);
            let record = normalized.record;

            if let Some(store) = self.store.as_mut() {
                // the record stays live either way
                if let Err(e) = store.begin().and_then(|_| store.insert_at(&record, now)) {
                    self.store_failures += 1;
                    tlog!(
                        "[session] {:08X} not stored ({} so far): {}",
                        record.sid,
                        self.store_failures,
                        e
                    );
                }
            }

            if self.mode == ViewMode::Day && self.node == Some(record.sid) {
                self.view.add_entry_full(&record);
            }
            produced.push(record);
        }
        produced
    }

    /// Read whatever the source has and ingest it. Returns the records produced.
    pub fn ingest_from(
        &mut self,
        source: &mut dyn ByteSource,
        now: &DateTime<Local>,
    ) -> std::io::Result<Vec<SensorRecord>> {
        let mut buf = [0u8; READ_CHUNK];
        let n = source.read_available(&mut buf)?;
        Ok(self.ingest(&buf[..n], now))
    }

    /// Commit and renew the store transaction when the period has elapsed.
    pub fn tick(&mut self, now: &DateTime<Local>) -> bool {
        if !self.cadence.due(now) {
            return false;
        }
        match self.store.as_mut().map(WsnsStore::commit_and_renew) {
            Some(Ok(())) => true,
            Some(Err(_)) | None => false,
        }
    }

    // ========================================================================
    // View control
    // ========================================================================

    pub fn select_node(&mut self, sid: u32) {
        if self.node != Some(sid) {
            tlog!("[session] Node {:08X} selected", sid);
        }
        self.node = Some(sid);
        self.view.set_node(Some(sid));
    }

    /// Drop all per-device state of `sid`: sample period estimate, live
    /// records and accel trail. Stored rows are kept.
    pub fn forget_node(&mut self, sid: u32) {
        self.normalizer.reset_device(sid);
        self.live.clear_device(sid);
        if self.node == Some(sid) {
            self.node = None;
            self.view.set_node(None);
        }
        tlog!("[session] Node {:08X} forgotten", sid);
    }

    /// Show the last LIVE_VIEW_DUR seconds of the selected node from the live
    /// buffer. A cursor on a live sample follows it to its new bucket.
    pub fn plot_live(&mut self, now: &DateTime<Local>, sink: &mut dyn RenderSink) {
        let Some(sid) = self.node else {
            return;
        };
        let last_pick = self
            .view
            .pseudo_cursor_idx()
            .filter(|&i| i < DRAW_WIDTH)
            .and_then(|i| self.view.decimated().record(i))
            .map(|r| (r.sid, r.ts));

        self.mode = ViewMode::Live;
        self.view.reset_zoom();
        if let Err(e) = self
            .view
            .set_start_epoch_and_duration(now.timestamp() - LIVE_VIEW_DUR, LIVE_VIEW_DUR, DRAW_WIDTH)
        {
            tlog!("[session] Live window rejected: {}", e);
            return;
        }

        // newest first
        let mut cursor = None;
        for record in self.live.records(sid).rev() {
            let placed = self.view.add_entry(record);
            if placed.is_some() && last_pick == Some((record.sid, record.ts)) {
                cursor = placed;
            }
        }
        self.view.finalize_entry();
        self.view.set_cursor(cursor);
        sink.render(&self.view);
    }

    /// Random-sample overview of `sid`: today, or the day of its newest record
    /// when that is before today. Returns the number of samples shown.
    pub fn preview_day(&mut self, sid: u32, now: &DateTime<Local>, sink: &mut dyn RenderSink) -> usize {
        self.select_node(sid);
        let Some(store) = self.store.as_ref() else {
            return 0;
        };

        let today = Calendar::from_datetime(now);
        let Ok((today_start, _)) = day_range(today.year, today.month, today.day) else {
            return 0;
        };
        let day = match store.query_oldest_and_newest(sid) {
            Ok((_, newest)) if newest < today_start => Calendar::from_epoch(newest).unwrap_or(today),
            _ => today,
        };
        let Ok((start, _)) = day_range(day.year, day.month, day.day) else {
            return 0;
        };

        self.mode = ViewMode::Preview;
        self.view.reset_zoom();
        if let Err(e) = self.view.set_start_epoch_and_duration(start, DAY_SECS, DRAW_WIDTH) {
            tlog!("[session] Preview window rejected: {}", e);
            return 0;
        }

        let view = &mut self.view;
        let count = store
            .query_sensor_data(sid, start, start + DAY_SECS - 1, QueryMode::RandomSample, |r| {
                view.add_entry(&r);
            })
            .unwrap_or(0);
        self.view.finalize_entry();
        sink.render(&self.view);
        count
    }

    /// Load one local day of `sid` at full resolution, backfilled with live
    /// records newer than the stored ones. Returns the number of stored records.
    pub fn open_day(
        &mut self,
        sid: u32,
        year: i32,
        month: u32,
        day: u32,
        sink: &mut dyn RenderSink,
    ) -> StoreResult<usize> {
        self.select_node(sid);
        let (start, _) = day_range(year, month, day)?;

        self.mode = ViewMode::Day;
        self.view.reset_zoom();
        self.view.clear_full();
        if let Err(e) = self.view.set_start_epoch_and_duration(start, DAY_SECS, DRAW_WIDTH) {
            tlog!("[session] Day window rejected: {}", e);
            return Ok(0);
        }

        let mut watermark = start - 1;
        let mut count = 0;
        if let Some(store) = self.store.as_ref() {
            let view = &mut self.view;
            count = store.query_sensor_data(sid, start, start + DAY_SECS - 1, QueryMode::Ordered, |r| {
                if let Some(ts) = r.ts {
                    watermark = watermark.max(ts);
                }
                view.add_entry_full(&r);
            })?;
        }

        self.live.set_watermark(sid, watermark);
        for record in self.live.records_after_watermark(sid) {
            self.view.add_entry_full(record);
        }

        self.view.pseudo_reload();
        sink.render(&self.view);
        tlog!(
            "[session] {:08X} {:04}-{:02}-{:02}: {} stored, {} slots",
            sid,
            year,
            month,
            day,
            count,
            self.view.full().occupied_count()
        );
        Ok(count)
    }

    pub fn scale_up(&mut self, anchor_x: Option<usize>, sink: &mut dyn RenderSink) -> bool {
        let changed = self.mode == ViewMode::Day && self.view.pseudo_scale_up(anchor_x);
        if changed {
            sink.render(&self.view);
        }
        changed
    }

    pub fn scale_down(&mut self, anchor_x: Option<usize>, sink: &mut dyn RenderSink) -> bool {
        let changed = self.mode == ViewMode::Day && self.view.pseudo_scale_down(anchor_x);
        if changed {
            sink.render(&self.view);
        }
        changed
    }

    /// Cursor to the previous sample; the live window searches display
    /// buckets, a day view searches the full-resolution buffer.
    pub fn pick_prev(&mut self) -> Option<SensorRecord> {
        let live = self.mode != ViewMode::Day;
        self.view.pick_sample_prev(live)?;
        self.view.picked().cloned()
    }

    pub fn pick_next(&mut self) -> Option<SensorRecord> {
        let live = self.mode != ViewMode::Day;
        self.view.pick_sample_next(live)?;
        self.view.picked().cloned()
    }

    pub fn pick_at(&mut self, x: i64) -> Option<SensorRecord> {
        let live = self.mode != ViewMode::Day;
        self.view.pick_sample_at(x, live)?;
        self.view.picked().cloned()
    }

    /// Redraw after new records arrived.
    pub fn refresh(&mut self, now: &DateTime<Local>, sink: &mut dyn RenderSink) {
        match self.mode {
            ViewMode::Live => self.plot_live(now, sink),
            ViewMode::Day => {
                self.view.pseudo_reload();
                sink.render(&self.view);
            }
            ViewMode::Preview => {}
        }
    }

    /// Commit pending inserts and close the store.
    pub fn close(mut self) -> StoreResult<()> {
        match self.store.take() {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }
}
