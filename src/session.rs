use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

/// Daily counters feeding the risk gate. Rolls over on UTC midnight.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    day: i64,
    trades_today: u32,
    daily_loss_usd: f64,
    realized_total: f64,
}

impl SessionCounters {
    pub fn seeded(now: DateTime<Utc>, trades_today: u32) -> Self {
        Self {
            day: day_number(now),
            trades_today,
            daily_loss_usd: 0.0,
            realized_total: 0.0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let day = day_number(now);
        if day != self.day {
            self.day = day;
            self.trades_today = 0;
            self.daily_loss_usd = 0.0;
        }
    }

    pub fn note_trade(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.trades_today += 1;
    }

    pub fn note_realized(&mut self, pnl: f64, now: DateTime<Utc>) {
        self.roll(now);
        self.realized_total += pnl;
        if pnl < 0.0 {
            self.daily_loss_usd += -pnl;
        }
    }

    pub fn snapshot(&mut self, now: DateTime<Utc>) -> (u32, f64) {
        self.roll(now);
        (self.trades_today, self.daily_loss_usd)
    }

    /// Cumulative realized PnL this process lifetime; not reset at midnight.
    pub fn realized_total(&self) -> f64 {
        self.realized_total
    }
}

fn day_number(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis().div_euclid(86_400_000)
}

/// Mutable per-process state that would otherwise be global: the daily
/// counters, the per-symbol leverage-already-set cache and the szDecimals
/// cache. Passed by reference everywhere it is needed.
#[derive(Default)]
pub struct Session {
    pub counters: Mutex<SessionCounters>,
    pub leverage_set: Mutex<HashSet<String>>,
    pub sz_decimals: RwLock<HashMap<String, u32>>,
}

impl Session {
    pub fn new(counters: SessionCounters) -> Self {
        Self {
            counters: Mutex::new(counters),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counters_roll_over_utc_midnight() {
        let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 5, 0).unwrap();

        let mut counters = SessionCounters::seeded(day1, 0);
        counters.note_trade(day1);
        counters.note_realized(-50.0, day1);
        assert_eq!(counters.snapshot(day1), (1, 50.0));

        let (trades, loss) = counters.snapshot(day2);
        assert_eq!(trades, 0);
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn profits_do_not_reduce_daily_loss() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut counters = SessionCounters::seeded(now, 0);
        counters.note_realized(-30.0, now);
        counters.note_realized(100.0, now);
        assert_eq!(counters.snapshot(now).1, 30.0);
    }

    #[test]
    fn seeding_survives_restart_semantics() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut counters = SessionCounters::seeded(now, 4);
        assert_eq!(counters.snapshot(now).0, 4);
    }
}
