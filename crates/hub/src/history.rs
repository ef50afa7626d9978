//! Fixed-capacity rolling window per sensor channel, used for charting.
//! Points are kept in ascending timestamp order; once a channel exceeds its
//! capacity the oldest point is evicted.

use std::collections::VecDeque;

use crate::model::{DataPoint, HistoricalData, SensorChannel, SensorReading};

/// Default number of points retained per channel.
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    channels: [VecDeque<DataPoint>; 5],
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            channels: std::array::from_fn(|_| VecDeque::with_capacity(capacity + 1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert one point, keeping ascending order, then evict from the front
    /// until the channel is back at capacity.
    pub fn append(&mut self, channel: SensorChannel, point: DataPoint) {
        let buf = &mut self.channels[channel.index()];
        match buf.back() {
            Some(last) if point.timestamp < last.timestamp => {
                let pos = buf.partition_point(|p| p.timestamp <= point.timestamp);
                buf.insert(pos, point);
            }
            _ => buf.push_back(point),
        }
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    /// Append every channel of a confirmed reading.
    pub fn append_reading(&mut self, reading: &SensorReading) {
        for channel in SensorChannel::ALL {
            self.append(
                channel,
                DataPoint {
                    timestamp: reading.timestamp,
                    value: reading.value(channel),
                },
            );
        }
    }

    /// Fold a polled series into the channel. Points whose timestamp is
    /// already present are skipped.
    pub fn merge(&mut self, channel: SensorChannel, points: &[DataPoint]) -> usize {
        let mut added = 0;
        for p in points {
            let exists = self.channels[channel.index()]
                .iter()
                .any(|q| q.timestamp == p.timestamp);
            if !exists {
                self.append(channel, *p);
                added += 1;
            }
        }
        added
    }

    pub fn merge_all(&mut self, data: &HistoricalData) -> usize {
        SensorChannel::ALL
            .iter()
            .map(|&c| self.merge(c, data.channel(c)))
            .sum()
    }

    /// A copy of the channel's window, oldest first.
    pub fn window(&self, channel: SensorChannel) -> Vec<DataPoint> {
        self.channels[channel.index()].iter().copied().collect()
    }

    pub fn len(&self, channel: SensorChannel) -> usize {
        self.channels[channel.index()].len()
    }

    pub fn to_data(&self) -> HistoricalData {
        let mut data = HistoricalData::default();
        for channel in SensorChannel::ALL {
            *data.channel_mut(channel) = self.window(channel);
        }
        data
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_714_564_800).unwrap()
    }

    fn pt(secs: i64, value: f64) -> DataPoint {
        DataPoint {
            timestamp: t0() + Duration::seconds(secs),
            value,
        }
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut h = HistoryBuffer::new(5);
        for i in 0..20 {
            h.append(SensorChannel::Ph, pt(i, i as f64));
            assert!(h.len(SensorChannel::Ph) <= 5);
        }
        assert_eq!(h.len(SensorChannel::Ph), 5);
    }

    #[test]
    fn overflow_evicts_exactly_the_oldest() {
        let mut h = HistoryBuffer::new(3);
        for i in 0..3 {
            h.append(SensorChannel::Tds, pt(i, i as f64));
        }
        h.append(SensorChannel::Tds, pt(3, 3.0));

        let w = h.window(SensorChannel::Tds);
        let values: Vec<f64> = w.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn window_is_ascending() {
        let mut h = HistoryBuffer::new(10);
        h.append(SensorChannel::Ph, pt(10, 1.0));
        h.append(SensorChannel::Ph, pt(30, 3.0));
        h.append(SensorChannel::Ph, pt(20, 2.0)); // late arrival
        let w = h.window(SensorChannel::Ph);
        assert!(w.windows(2).all(|p| p[0].timestamp <= p[1].timestamp));
        assert_eq!(w[1].value, 2.0);
    }

    #[test]
    fn window_is_a_copy() {
        let mut h = HistoryBuffer::new(4);
        h.append(SensorChannel::Ph, pt(0, 6.0));
        let before = h.window(SensorChannel::Ph);
        h.append(SensorChannel::Ph, pt(1, 6.1));
        assert_eq!(before.len(), 1);
        assert_eq!(h.len(SensorChannel::Ph), 2);
    }

    #[test]
    fn channels_are_independent() {
        let mut h = HistoryBuffer::new(4);
        h.append(SensorChannel::Ph, pt(0, 6.0));
        assert_eq!(h.len(SensorChannel::Tds), 0);
    }

    #[test]
    fn merge_skips_duplicate_timestamps() {
        let mut h = HistoryBuffer::new(10);
        h.append(SensorChannel::Tds, pt(0, 800.0));
        let added = h.merge(SensorChannel::Tds, &[pt(0, 801.0), pt(60, 805.0)]);
        assert_eq!(added, 1);
        assert_eq!(h.window(SensorChannel::Tds)[0].value, 800.0);
    }

    #[test]
    fn merge_trims_to_capacity_keeping_newest() {
        let mut h = HistoryBuffer::new(3);
        let series: Vec<DataPoint> = (0..6).map(|i| pt(i, i as f64)).collect();
        h.merge(SensorChannel::AirHumidity, &series);
        let values: Vec<f64> = h
            .window(SensorChannel::AirHumidity)
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let mut h = HistoryBuffer::new(0);
        h.append(SensorChannel::Ph, pt(0, 1.0));
        h.append(SensorChannel::Ph, pt(1, 2.0));
        assert_eq!(h.capacity(), 1);
        assert_eq!(h.window(SensorChannel::Ph)[0].value, 2.0);
    }
}
