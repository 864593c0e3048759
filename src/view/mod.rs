// src/view/mod.rs
//
// Multi-resolution view over one device's time series.
//
// Two buffers cover the same window with different policies: the
// full-resolution buffer keeps the latest record per second, the decimated
// buffer averages everything that falls into one display bucket. Zooming
// rebuilds the decimated buffer from the full-resolution one at a new scale.
// The visible part is always DRAW_WIDTH buckets starting at `pseudo_start_idx`.

pub mod decimated;
pub mod full;

pub use decimated::{Bucket, DecimatedBuffer, BM_EV_ID, BM_MAG, BM_VALUE, BM_VALUE1, BM_VALUE2, BM_VALUE3, BM_VCC};
pub use full::FullResolutionBuffer;

use crate::error::ViewBoundsError;
use crate::record::SensorRecord;

// ============================================================================
// Constants
// ============================================================================

/// Visible buckets.
pub const DRAW_WIDTH: usize = 450;
/// Seconds covered by the live window.
pub const LIVE_VIEW_DUR: i64 = 450;
/// Slots of the full-resolution buffer (one second each over 24h).
pub const DATA_WIDTH: usize = 86400;
/// Zoom levels, in display widths.
pub const SCALES: [u32; 8] = [1, 2, 4, 8, 24, 48, 96, 192];
/// Pixels searched on either side of a pick position.
pub const PICK_RADIUS: i64 = 5;
const PICK_MARGIN: usize = DRAW_WIDTH / 6;

// ============================================================================
// View
// ============================================================================

#[derive(Debug, Clone)]
pub struct MultiResolutionView {
    t_start: i64,
    t_end: i64,
    t_step: i64,
    pseudo_width: usize,
    pseudo_scale: u32,
    pseudo_start_idx: usize,
    pseudo_cursor_idx: Option<usize>,
    full_cursor_idx: Option<usize>,
    /// Device whose buckets live picks may land on; any device when unset.
    node: Option<u32>,
    decimated: DecimatedBuffer,
    full: FullResolutionBuffer,
}

impl Default for MultiResolutionView {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiResolutionView {
    pub fn new() -> Self {
        let mut decimated = DecimatedBuffer::new();
        decimated.reset(0, 1, DRAW_WIDTH);
        MultiResolutionView {
            t_start: 0,
            t_end: DRAW_WIDTH as i64,
            t_step: 1,
            pseudo_width: DRAW_WIDTH,
            pseudo_scale: 1,
            pseudo_start_idx: 0,
            pseudo_cursor_idx: None,
            full_cursor_idx: None,
            node: None,
            decimated,
            full: FullResolutionBuffer::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn t_start(&self) -> i64 {
        self.t_start
    }

    pub fn t_end(&self) -> i64 {
        self.t_end
    }

    pub fn t_step(&self) -> i64 {
        self.t_step
    }

    pub fn pseudo_width(&self) -> usize {
        self.pseudo_width
    }

    pub fn pseudo_scale(&self) -> u32 {
        self.pseudo_scale
    }

    pub fn pseudo_start_idx(&self) -> usize {
        self.pseudo_start_idx
    }

    pub fn pseudo_cursor_idx(&self) -> Option<usize> {
        self.pseudo_cursor_idx
    }

    pub fn full_cursor_idx(&self) -> Option<usize> {
        self.full_cursor_idx
    }

    pub fn node(&self) -> Option<u32> {
        self.node
    }

    pub fn set_node(&mut self, sid: Option<u32>) {
        self.node = sid;
    }

    pub fn decimated(&self) -> &DecimatedBuffer {
        &self.decimated
    }

    pub fn full(&self) -> &FullResolutionBuffer {
        &self.full
    }

    /// Full-resolution slots per display bucket at the current scale.
    pub fn samples_per_pixel(&self) -> usize {
        ((DATA_WIDTH / DRAW_WIDTH) / self.pseudo_scale as usize).max(1)
    }

    fn max_start(&self) -> usize {
        self.pseudo_width.saturating_sub(DRAW_WIDTH)
    }

    /// Visible bucket at screen column `x`.
    pub fn visible_bucket(&self, x: usize) -> Result<&Bucket, ViewBoundsError> {
        let index = self.pseudo_start_idx + x;
        match self.decimated.bucket(index) {
            Some(b) if x < DRAW_WIDTH => Ok(b),
            _ => Err(ViewBoundsError::OutOfRange {
                index: x as i64,
                limit: DRAW_WIDTH.min(self.pseudo_width - self.pseudo_start_idx),
            }),
        }
    }

    /// The visible window: `(screen_x, bucket)` for each column.
    pub fn visible(&self) -> impl Iterator<Item = (usize, &Bucket)> + '_ {
        self.decimated
            .buckets()
            .iter()
            .skip(self.pseudo_start_idx)
            .take(DRAW_WIDTH)
            .enumerate()
    }

    /// Record under the cursor: the full-resolution slot when one is picked,
    /// otherwise the averaged bucket.
    pub fn picked(&self) -> Option<&SensorRecord> {
        match (self.full_cursor_idx, self.pseudo_cursor_idx) {
            (Some(i), _) => self.full.get(i),
            (None, Some(i)) => self.decimated.record(i),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Window and entries
    // ------------------------------------------------------------------------

    /// Define the window `[start, start + duration)` split into `width` buckets.
    /// Clears the decimated buffer and the cursor; the full-resolution buffer
    /// keeps its contents and follows the new geometry.
    pub fn set_start_epoch_and_duration(
        &mut self,
        start: i64,
        duration: i64,
        width: usize,
    ) -> Result<(), ViewBoundsError> {
        if width == 0 || duration <= 0 || duration % width as i64 != 0 {
            return Err(ViewBoundsError::UnalignedDuration { duration, width });
        }

        self.pseudo_width = width;
        if self.pseudo_scale == 1 {
            self.pseudo_start_idx = 0;
        } else {
            self.pseudo_start_idx = self.pseudo_start_idx.min(self.max_start());
        }
        self.pseudo_cursor_idx = None;

        self.t_start = start;
        self.t_end = start + duration;
        self.t_step = duration / width as i64;
        self.full.configure(start, duration);
        self.decimated.reset(start, self.t_step, width);
        Ok(())
    }

    /// Back to scale 1, scrolled to the start, cursors cleared.
    pub fn reset_zoom(&mut self) {
        self.pseudo_scale = 1;
        self.pseudo_start_idx = 0;
        self.pseudo_cursor_idx = None;
        self.full_cursor_idx = None;
    }

    /// Place the display cursor directly; clears the full-resolution cursor.
    pub fn set_cursor(&mut self, index: Option<usize>) {
        self.pseudo_cursor_idx = index.filter(|&i| i < self.pseudo_width);
        self.full_cursor_idx = None;
    }

    pub fn add_entry_full(&mut self, record: &SensorRecord) -> Option<usize> {
        if record.ts.is_some_and(|ts| ts >= self.t_start && ts < self.t_end) {
            self.full.add(record)
        } else {
            None
        }
    }

    /// Bucket index the record was added to, `None` when outside the window.
    pub fn add_entry(&mut self, record: &SensorRecord) -> Option<usize> {
        match record.ts {
            Some(ts) if ts >= self.t_start && ts < self.t_end => self.decimated.add(record),
            _ => None,
        }
    }

    pub fn finalize_entry(&mut self) {
        self.decimated.finalize();
    }

    pub fn clear_full(&mut self) {
        self.full.clear();
        self.full_cursor_idx = None;
    }

    /// Rebuild the decimated buffer from the full-resolution buffer at the
    /// current scale, keeping the scroll offset and mapping the full cursor.
    pub fn pseudo_reload(&mut self) {
        let saved_start = self.pseudo_start_idx;
        let width = self.pseudo_scale as usize * DRAW_WIDTH;
        if let Err(e) = self.set_start_epoch_and_duration(self.t_start, self.t_end - self.t_start, width) {
            tlog!("[view] Reload skipped: {}", e);
            return;
        }

        for (_, record) in self.full.iter() {
            self.decimated.add(record);
        }
        self.finalize_entry();

        self.pseudo_start_idx = saved_start.min(self.max_start());
        if let Some(fc) = self.full_cursor_idx {
            self.pseudo_cursor_idx = Some(fc / self.samples_per_pixel());
        }
    }

    // ------------------------------------------------------------------------
    // Zoom and scroll
    // ------------------------------------------------------------------------

    pub fn pseudo_scale_up(&mut self, anchor_x: Option<usize>) -> bool {
        let next = SCALES.iter().copied().find(|&s| s > self.pseudo_scale);
        self.change_scale(next, anchor_x)
    }

    pub fn pseudo_scale_down(&mut self, anchor_x: Option<usize>) -> bool {
        let next = SCALES.iter().rev().copied().find(|&s| s < self.pseudo_scale);
        self.change_scale(next, anchor_x)
    }

    fn change_scale(&mut self, new_scale: Option<u32>, anchor_x: Option<usize>) -> bool {
        let Some(new_scale) = new_scale else {
            return false;
        };
        if !self.full.is_enabled() {
            // zoom rebuilds from the full-resolution buffer
            return false;
        }

        let draw = DRAW_WIDTH as i64;
        let x = match (anchor_x, self.pseudo_cursor_idx) {
            (Some(x), _) => x as i64,
            (None, Some(c)) => c as i64 - self.pseudo_start_idx as i64,
            (None, None) => draw / 2,
        };
        let i0 = self.pseudo_start_idx as i64 + x;
        let i1 = i0 * i64::from(new_scale) / i64::from(self.pseudo_scale);
        let i_start = (i1 - x).clamp(0, i64::from(new_scale) * draw - draw);

        self.pseudo_scale = new_scale;
        self.pseudo_reload();
        self.pseudo_start_idx = (i_start as usize).min(self.max_start());
        true
    }

    /// Scroll so the window starts at bucket `start`, clamped to the buffer.
    pub fn scroll_to(&mut self, start: i64) {
        self.pseudo_start_idx = start.clamp(0, self.max_start() as i64) as usize;
    }

    pub fn scroll_by(&mut self, delta: i64) {
        self.scroll_to(self.pseudo_start_idx as i64 + delta);
    }

    // ------------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------------

    fn live_hit(&self, index: usize) -> bool {
        self.decimated
            .record(index)
            .is_some_and(|r| self.node.map_or(true, |sid| r.sid == sid))
    }

    /// Scroll so the picked full-resolution slot is visible with a margin,
    /// and place the display cursor on it.
    fn adjust_view_to_full_cursor(&mut self) {
        let Some(fc) = self.full_cursor_idx else {
            return;
        };
        let ip = fc / self.samples_per_pixel();

        if ip < self.pseudo_start_idx + PICK_MARGIN {
            self.pseudo_start_idx = ip.saturating_sub(PICK_MARGIN);
        }
        if ip + PICK_MARGIN >= self.pseudo_start_idx + DRAW_WIDTH {
            self.pseudo_start_idx = (ip + PICK_MARGIN - DRAW_WIDTH).min(self.max_start());
        }
        self.pseudo_cursor_idx = Some(ip);
    }

    /// Move the cursor to the previous populated bucket (live) or slot.
    pub fn pick_sample_prev(&mut self, live: bool) -> Option<usize> {
        if live {
            let from = match self.pseudo_cursor_idx {
                Some(0) => return None,
                Some(c) => c - 1,
                None => DRAW_WIDTH - 1,
            };
            let found = (0..=from.min(DRAW_WIDTH - 1)).rev().find(|&i| self.live_hit(i))?;
            self.full_cursor_idx = None;
            self.pseudo_cursor_idx = Some(found);
            Some(found)
        } else {
            if !self.full.is_enabled() {
                return None;
            }
            let from = match self.full_cursor_idx {
                Some(0) => return None,
                Some(c) => c - 1,
                None => (self.pseudo_start_idx + DRAW_WIDTH) * self.samples_per_pixel(),
            };
            let found = self.full.find_prev(from)?;
            self.full_cursor_idx = Some(found);
            self.adjust_view_to_full_cursor();
            Some(found)
        }
    }

    /// Move the cursor to the next populated bucket (live) or slot.
    pub fn pick_sample_next(&mut self, live: bool) -> Option<usize> {
        if live {
            let from = self.pseudo_cursor_idx.map_or(0, |c| c + 1);
            let found = (from..DRAW_WIDTH).find(|&i| self.live_hit(i))?;
            self.full_cursor_idx = None;
            self.pseudo_cursor_idx = Some(found);
            Some(found)
        } else {
            if !self.full.is_enabled() {
                return None;
            }
            let from = self
                .full_cursor_idx
                .map_or(self.pseudo_start_idx * self.samples_per_pixel(), |c| c + 1);
            let found = self.full.find_next(from)?;
            self.full_cursor_idx = Some(found);
            self.adjust_view_to_full_cursor();
            Some(found)
        }
    }

    /// Place the cursor on the populated sample nearest to screen column `x`.
    pub fn pick_sample_at(&mut self, x: i64, live: bool) -> Option<usize> {
        if live {
            let hit = |i: i64| (0..DRAW_WIDTH as i64).contains(&i) && self.live_hit(i as usize);
            let found = if hit(x) {
                Some(x)
            } else {
                (1..PICK_RADIUS).find_map(|d| {
                    if hit(x - d) {
                        Some(x - d)
                    } else if hit(x + d) {
                        Some(x + d)
                    } else {
                        None
                    }
                })
            };
            let found = found? as usize;
            self.pseudo_cursor_idx = Some(found);
            self.full_cursor_idx = None;
            Some(found)
        } else {
            if !self.full.is_enabled() {
                return None;
            }
            let spp = self.samples_per_pixel() as i64;
            let center = (self.pseudo_start_idx as i64 + x) * spp;
            let found = self.full.nearest(center, PICK_RADIUS * spp)?;
            self.pseudo_cursor_idx = Some(found / spp as usize);
            self.full_cursor_idx = Some(found);
            Some(found)
        }
    }
}
