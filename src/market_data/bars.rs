// =============================================================================
// Rolling OHLC bars built from raw trades
// =============================================================================
//
// Each symbol owns one `BarSeries`. Trades mutate the current bucket in place;
// when a trade lands in a new bucket the old one is flushed into the closed
// ring, which is trimmed to a fixed capacity.
// =============================================================================

use std::collections::VecDeque;

/// One closed (or in-progress) OHLC bar at a fixed timeframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// Bucket key: `(trade_ts_ms / tf_ms) * tf_ms`.
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    fn seed(open_time_ms: i64, price: f64) -> Self {
        Self {
            open_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

/// Per-symbol bar accumulator plus a bounded ring of closed bars.
#[derive(Debug)]
pub struct BarSeries {
    tf_ms: i64,
    capacity: usize,
    current: Option<Bar>,
    closed: VecDeque<Bar>,
}

impl BarSeries {
    /// `capacity` is the number of closed bars retained; the caller derives it
    /// from the ATR lookback (see `Config::bar_capacity`).
    pub fn new(tf_sec: u64, capacity: usize) -> Self {
        Self {
            tf_ms: (tf_sec.max(1) * 1000) as i64,
            capacity: capacity.max(1),
            current: None,
            closed: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Fold one trade into the series. Returns the bar that closed, if this
    /// trade rolled the bucket.
    pub fn on_trade(&mut self, ts_ms: i64, price: f64) -> Option<Bar> {
        let bucket = (ts_ms / self.tf_ms) * self.tf_ms;

        match self.current {
            Some(ref mut bar) if bar.open_time_ms == bucket => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                None
            }
            Some(bar) => {
                self.closed.push_back(bar);
                while self.closed.len() > self.capacity {
                    self.closed.pop_front();
                }
                self.current = Some(Bar::seed(bucket, price));
                Some(bar)
            }
            None => {
                self.current = Some(Bar::seed(bucket, price));
                None
            }
        }
    }

    /// Most recent `n` closed bars, oldest first.
    pub fn recent_closed(&self, n: usize) -> Vec<Bar> {
        let start = self.closed.len().saturating_sub(n);
        self.closed.iter().skip(start).copied().collect()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    /// Close of the latest completed bar, if any.
    pub fn last_closed(&self) -> Option<&Bar> {
        self.closed.back()
    }

    /// The in-progress bar, if a trade has been seen since the last roll.
    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trade_seeds_the_bucket() {
        let mut s = BarSeries::new(60, 10);
        assert!(s.on_trade(61_500, 100.0).is_none());

        let cur = s.current().unwrap();
        assert_eq!(cur.open_time_ms, 60_000);
        assert_eq!(cur.open, 100.0);
        assert_eq!(cur.high, 100.0);
        assert_eq!(cur.low, 100.0);
        assert_eq!(cur.close, 100.0);
        assert_eq!(s.closed_len(), 0);
    }

    #[test]
    fn trades_in_same_bucket_update_hlc() {
        let mut s = BarSeries::new(60, 10);
        s.on_trade(0, 100.0);
        s.on_trade(10_000, 105.0);
        s.on_trade(20_000, 95.0);
        s.on_trade(30_000, 101.0);

        let cur = s.current().unwrap();
        assert_eq!(cur.open, 100.0);
        assert_eq!(cur.high, 105.0);
        assert_eq!(cur.low, 95.0);
        assert_eq!(cur.close, 101.0);
    }

    #[test]
    fn bucket_roll_flushes_closed_bar() {
        let mut s = BarSeries::new(60, 10);
        s.on_trade(0, 100.0);
        s.on_trade(30_000, 102.0);

        let flushed = s.on_trade(60_000, 103.0).expect("bucket must roll");
        assert_eq!(flushed.open_time_ms, 0);
        assert_eq!(flushed.close, 102.0);
        assert_eq!(s.closed_len(), 1);
        assert_eq!(s.current().unwrap().open_time_ms, 60_000);
    }

    #[test]
    fn ring_trims_to_capacity() {
        let mut s = BarSeries::new(60, 3);
        for i in 0..6 {
            s.on_trade(i * 60_000, 100.0 + i as f64);
        }
        // 5 rolls happened, only 3 closed bars kept.
        assert_eq!(s.closed_len(), 3);
        let recent = s.recent_closed(10);
        assert_eq!(recent[0].close, 102.0);
        assert_eq!(recent[2].close, 104.0);
    }

    #[test]
    fn tick_ordering_preserved_across_buckets() {
        // Two trades with t1 < t2 must close the t1 bar no later than the t2
        // bar opens.
        let mut s = BarSeries::new(60, 10);
        s.on_trade(10_000, 100.0);
        let closed = s.on_trade(70_000, 101.0).unwrap();
        assert!(closed.open_time_ms < s.current().unwrap().open_time_ms);
    }

    #[test]
    fn recent_closed_is_oldest_first() {
        let mut s = BarSeries::new(60, 10);
        for i in 0..4 {
            s.on_trade(i * 60_000, 100.0 + i as f64);
        }
        let last2 = s.recent_closed(2);
        assert_eq!(last2.len(), 2);
        assert!(last2[0].open_time_ms < last2[1].open_time_ms);
    }
}
