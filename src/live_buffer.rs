// src/live_buffer.rs
//
// Per-device bounded FIFOs of the most recent records and accelerometer
// samples. Filled as packets arrive, before the store commits anything.

use std::collections::{HashMap, VecDeque};

use crate::normalizer::{Normalized, TrailSample};
use crate::record::SensorRecord;

pub const LIVE_CAPACITY: usize = 1024;

// ============================================================================
// FixedQueue
// ============================================================================

/// Bounded FIFO; pushing into a full queue evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct FixedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FixedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        FixedQueue {
            items: VecDeque::with_capacity(capacity.min(LIVE_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Append, returning the evicted entry when the queue was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// LiveBuffer
// ============================================================================

#[derive(Debug)]
struct DeviceLive {
    records: FixedQueue<SensorRecord>,
    trail: FixedQueue<TrailSample>,
    /// Newest timestamp already covered by a store query.
    watermark: Option<i64>,
}

impl DeviceLive {
    fn new(capacity: usize) -> Self {
        DeviceLive {
            records: FixedQueue::new(capacity),
            trail: FixedQueue::new(capacity),
            watermark: None,
        }
    }
}

#[derive(Debug)]
pub struct LiveBuffer {
    capacity: usize,
    devices: HashMap<u32, DeviceLive>,
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new(LIVE_CAPACITY)
    }
}

impl LiveBuffer {
    pub fn new(capacity: usize) -> Self {
        LiveBuffer {
            capacity,
            devices: HashMap::new(),
        }
    }

    fn device_mut(&mut self, sid: u32) -> &mut DeviceLive {
        let capacity = self.capacity;
        self.devices
            .entry(sid)
            .or_insert_with(|| DeviceLive::new(capacity))
    }

    /// Keep a normalised packet: its record plus any accelerometer samples.
    pub fn push(&mut self, normalized: &Normalized) {
        let device = self.device_mut(normalized.record.sid);
        device.records.push(normalized.record.clone());
        for sample in &normalized.samples {
            device.trail.push(*sample);
        }
    }

    pub fn push_record(&mut self, record: SensorRecord) {
        self.device_mut(record.sid).records.push(record);
    }

    /// Records of `sid`, oldest first.
    pub fn records(&self, sid: u32) -> impl DoubleEndedIterator<Item = &SensorRecord> + '_ {
        self.devices
            .get(&sid)
            .into_iter()
            .flat_map(|d| d.records.iter())
    }

    pub fn latest(&self, sid: u32) -> Option<&SensorRecord> {
        self.devices.get(&sid).and_then(|d| d.records.back())
    }

    /// Accelerometer trail of `sid`, oldest first, placeholders included.
    pub fn trail(&self, sid: u32) -> impl Iterator<Item = &TrailSample> + '_ {
        self.devices
            .get(&sid)
            .into_iter()
            .flat_map(|d| d.trail.iter())
    }

    pub fn set_watermark(&mut self, sid: u32, ts: i64) {
        self.device_mut(sid).watermark = Some(ts);
    }

    pub fn watermark(&self, sid: u32) -> Option<i64> {
        self.devices.get(&sid).and_then(|d| d.watermark)
    }

    /// Records newer than the watermark; all records when none is set.
    pub fn records_after_watermark(&self, sid: u32) -> impl Iterator<Item = &SensorRecord> + '_ {
        let mark = self.watermark(sid);
        self.records(sid)
            .filter(move |r| match (mark, r.ts) {
                (Some(m), Some(ts)) => ts > m,
                (Some(_), None) => false,
                (None, _) => true,
            })
    }

    pub fn len(&self, sid: u32) -> usize {
        self.devices.get(&sid).map_or(0, |d| d.records.len())
    }

    /// Known devices, ascending.
    pub fn devices(&self) -> Vec<u32> {
        let mut sids: Vec<u32> = self.devices.keys().copied().collect();
        sids.sort_unstable();
        sids
    }

    pub fn clear_device(&mut self, sid: u32) {
        self.devices.remove(&sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::AccelPoint;
    use crate::record::pkt_type;

    fn record(sid: u32, ts: i64) -> SensorRecord {
        let mut r = SensorRecord::new(sid, pkt_type::AMB_STD);
        r.ts = Some(ts);
        r
    }

    #[test]
    fn test_fixed_queue_evicts_oldest() {
        let mut q = FixedQueue::new(3);
        assert_eq!(q.push(1), None);
        q.push(2);
        q.push(3);
        assert_eq!(q.push(4), Some(1));
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(q.front(), Some(&2));
        assert_eq!(q.back(), Some(&4));
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn test_per_device_capacity() {
        let mut live = LiveBuffer::new(4);
        for ts in 0..10 {
            live.push_record(record(1, ts));
        }
        live.push_record(record(2, 100));

        assert_eq!(live.len(1), 4);
        assert_eq!(live.len(2), 1);
        assert_eq!(live.len(3), 0);
        let ts: Vec<i64> = live.records(1).filter_map(|r| r.ts).collect();
        assert_eq!(ts, vec![6, 7, 8, 9]);
        assert_eq!(live.latest(1).and_then(|r| r.ts), Some(9));
        assert_eq!(live.devices(), vec![1, 2]);
    }

    #[test]
    fn test_watermark_filters_overlap() {
        let mut live = LiveBuffer::default();
        for ts in [10, 20, 30, 40] {
            live.push_record(record(7, ts));
        }
        assert_eq!(live.records_after_watermark(7).count(), 4);

        live.set_watermark(7, 20);
        let ts: Vec<i64> = live.records_after_watermark(7).filter_map(|r| r.ts).collect();
        assert_eq!(ts, vec![30, 40]);
        assert_eq!(live.watermark(7), Some(20));
    }

    #[test]
    fn test_push_keeps_trail() {
        let mut live = LiveBuffer::default();
        let point = AccelPoint {
            t_pkt_ms: 0,
            seq: 1,
            t_ms: 0,
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        live.push(&Normalized {
            record: record(5, 1),
            samples: vec![TrailSample::Placeholder, TrailSample::Sample(point)],
        });
        assert_eq!(live.trail(5).count(), 2);
        assert_eq!(live.trail(6).count(), 0);

        live.clear_device(5);
        assert_eq!(live.len(5), 0);
    }
}
