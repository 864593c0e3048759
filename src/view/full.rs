// src/view/full.rs
//
// Full-resolution buffer: one slot per 1/DATA_WIDTH of the window (one second
// for a 24h window). A record landing on an occupied slot replaces it.

use super::DATA_WIDTH;
use crate::record::SensorRecord;

#[derive(Debug, Clone)]
pub struct FullResolutionBuffer {
    slots: Vec<Option<SensorRecord>>,
    t_start: i64,
    /// Seconds per slot; zero while the window is not a multiple of DATA_WIDTH.
    t_step: i64,
    occupied: usize,
}

impl Default for FullResolutionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FullResolutionBuffer {
    pub fn new() -> Self {
        FullResolutionBuffer {
            slots: vec![None; DATA_WIDTH],
            t_start: 0,
            t_step: 0,
            occupied: 0,
        }
    }

    /// Set the window geometry. Contents are kept; `clear` empties them.
    /// Returns whether the buffer is usable for this window.
    pub fn configure(&mut self, t_start: i64, duration: i64) -> bool {
        self.t_start = t_start;
        self.t_step = if duration > 0 && duration % DATA_WIDTH as i64 == 0 {
            duration / DATA_WIDTH as i64
        } else {
            0
        };
        self.is_enabled()
    }

    pub fn is_enabled(&self) -> bool {
        self.t_step > 0
    }

    pub fn t_step(&self) -> i64 {
        self.t_step
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.occupied = 0;
    }

    /// Slot index of `ts`, if it falls inside the window.
    pub fn index_of(&self, ts: i64) -> Option<usize> {
        if !self.is_enabled() || ts < self.t_start {
            return None;
        }
        let i = ((ts - self.t_start) / self.t_step) as usize;
        (i < DATA_WIDTH).then_some(i)
    }

    /// Store `record` in its slot, replacing any occupant.
    pub fn add(&mut self, record: &SensorRecord) -> Option<usize> {
        let i = self.index_of(record.ts?)?;
        if self.slots[i].replace(record.clone()).is_none() {
            self.occupied += 1;
        }
        Some(i)
    }

    pub fn get(&self, index: usize) -> Option<&SensorRecord> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied
    }

    /// Occupied slots in time order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SensorRecord)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
    }

    /// Last occupied slot at or before `from`.
    pub fn find_prev(&self, from: usize) -> Option<usize> {
        let from = from.min(DATA_WIDTH - 1);
        (0..=from).rev().find(|&i| self.is_occupied(i))
    }

    /// First occupied slot at or after `from`.
    pub fn find_next(&self, from: usize) -> Option<usize> {
        (from..DATA_WIDTH).find(|&i| self.is_occupied(i))
    }

    /// Occupied slot nearest to `center` within `radius`, preferring the
    /// earlier slot on a tie.
    pub fn nearest(&self, center: i64, radius: i64) -> Option<usize> {
        let hit = |i: i64| (0..DATA_WIDTH as i64).contains(&i) && self.is_occupied(i as usize);
        if hit(center) {
            return Some(center as usize);
        }
        (1..radius).find_map(|d| {
            if hit(center - d) {
                Some((center - d) as usize)
            } else if hit(center + d) {
                Some((center + d) as usize)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::pkt_type;

    fn rec(ts: i64, v: f64) -> SensorRecord {
        let mut r = SensorRecord::new(1, pkt_type::AMB_STD);
        r.ts = Some(ts);
        r.value = Some(v);
        r
    }

    #[test]
    fn test_last_write_wins() {
        let mut full = FullResolutionBuffer::new();
        assert!(full.configure(1000, 86400));
        assert_eq!(full.add(&rec(1010, 1.0)), Some(10));
        assert_eq!(full.add(&rec(1010, 2.0)), Some(10));
        assert_eq!(full.get(10).and_then(|r| r.value), Some(2.0));
        assert_eq!(full.occupied_count(), 1);
    }

    #[test]
    fn test_out_of_window_and_disabled() {
        let mut full = FullResolutionBuffer::new();
        full.configure(1000, 86400);
        assert_eq!(full.add(&rec(999, 0.0)), None);
        assert_eq!(full.add(&rec(1000 + 86400, 0.0)), None);
        assert_eq!(full.add(&SensorRecord::new(1, 2)), None);

        assert!(!full.configure(1000, 450));
        assert_eq!(full.add(&rec(1001, 0.0)), None);

        // 48h window: two seconds per slot
        assert!(full.configure(0, 2 * 86400));
        assert_eq!(full.add(&rec(3, 0.0)), Some(1));
    }

    #[test]
    fn test_search() {
        let mut full = FullResolutionBuffer::new();
        full.configure(0, 86400);
        for ts in [100, 200, 86399] {
            full.add(&rec(ts, 0.0));
        }
        assert_eq!(full.find_prev(199), Some(100));
        assert_eq!(full.find_prev(99), None);
        assert_eq!(full.find_prev(usize::MAX), Some(86399));
        assert_eq!(full.find_next(101), Some(200));
        assert_eq!(full.find_next(86400), None);
        assert_eq!(full.nearest(103, 5), Some(100));
        assert_eq!(full.nearest(105, 5), None);
        assert_eq!(full.nearest(150, 100), Some(100));

        full.clear();
        assert_eq!(full.occupied_count(), 0);
        assert_eq!(full.iter().count(), 0);
    }
}
