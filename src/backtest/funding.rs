// Funding-rate history for the backtest: a JSON file cache in front of a
// synthetic generator. Boundary helpers implement the every-8-hours
// schedule at 00:00, 08:00 and 16:00 UTC.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use log::warn;

use super::types::FundingRate;

const FUNDING_HOURS: [u32; 3] = [0, 8, 16];

pub struct FundingFetcher {
    cache_dir: PathBuf,
}

impl FundingFetcher {
    pub fn new(cache_dir: &str) -> Self {
        Self {
            cache_dir: PathBuf::from(cache_dir),
        }
    }

    /// Loads funding rates from the cache, falling back to deterministic
    /// synthetic rates when no cached history exists.
    pub fn fetch_funding_rates(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<FundingRate> {
        if let Ok(cached) = self.load_from_cache(symbol, start, end) {
            if !cached.is_empty() {
                return cached;
            }
        }

        warn!("using synthetic funding rates for {symbol}");
        let rates = generate_synthetic_rates(symbol, start, end);
        if let Err(err) = self.save_to_cache(symbol, start, end, &rates) {
            warn!("failed to cache funding rates for {symbol}: {err}");
        }
        rates
    }

    fn cache_file_path(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> PathBuf {
        let name = format!(
            "funding_{symbol}_{}_{}.json",
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        );
        self.cache_dir.join(name)
    }

    fn load_from_cache(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FundingRate>> {
        let path = self.cache_file_path(symbol, start, end);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read funding cache {}", path.display()))?;
        serde_json::from_str(&data).context("parse funding cache")
    }

    fn save_to_cache(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        rates: &[FundingRate],
    ) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).context("create funding cache dir")?;
        let path = self.cache_file_path(symbol, start, end);
        let data = serde_json::to_string(rates).context("serialize funding rates")?;
        fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Synthetic 8-hourly rates with a per-asset base level and a deterministic
/// timestamp-derived variance, so replays are reproducible.
pub fn generate_synthetic_rates(
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<FundingRate> {
    let base_rate = match symbol {
        "BTCUSD" | "BTCINR" => 0.00015,
        "ETHUSD" | "ETHINR" => 0.0001,
        "SOLUSD" | "SOLINR" => 0.00008,
        _ => 0.0001,
    };

    let interval = Duration::hours(8);
    let mut current = truncate_to(start, interval);
    let mut rates = Vec::new();

    while current < end {
        let variance =
            ((current.timestamp() % 100) as f64 - 50.0) / 100.0 * base_rate * 0.5;
        rates.push(FundingRate {
            timestamp: current,
            symbol: symbol.to_string(),
            rate: base_rate + variance,
        });
        current += interval;
    }

    rates
}

fn truncate_to(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.num_seconds();
    let truncated = (t.timestamp() / secs) * secs;
    Utc.timestamp_opt(truncated, 0).single().unwrap_or(t)
}

/// The most recent rate at or before `t`; rates must be time-sorted.
pub fn funding_at_time(rates: &[FundingRate], t: DateTime<Utc>) -> f64 {
    let mut applicable = 0.0;
    for rate in rates {
        if rate.timestamp <= t {
            applicable = rate.rate;
        } else {
            break;
        }
    }
    applicable
}

/// Whether `t` is exactly a funding payment time.
pub fn is_funding_time(t: DateTime<Utc>) -> bool {
    let u = t.with_timezone(&Utc);
    FUNDING_HOURS.contains(&u.hour()) && u.minute() == 0 && u.second() == 0
}

/// Whether any funding boundary (00:00, 08:00, 16:00 UTC) lies in
/// (prev, curr].
pub fn crossed_funding_boundary(prev: DateTime<Utc>, curr: DateTime<Utc>) -> bool {
    for h in FUNDING_HOURS {
        let boundary = Utc
            .with_ymd_and_hms(curr.year(), curr.month(), curr.day(), h, 0, 0)
            .single();
        if let Some(boundary) = boundary {
            if prev < boundary && curr >= boundary {
                return true;
            }
        }
        // Day rollover always crosses the 00:00 boundary.
        if h == 0 && prev.day() != curr.day() {
            return true;
        }
    }
    false
}

/// The next funding time strictly after `t`.
pub fn next_funding_time(t: DateTime<Utc>) -> DateTime<Utc> {
    let hour = t.hour();
    let next_hour = if hour < 8 {
        8
    } else if hour < 16 {
        16
    } else {
        24
    };

    let base = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), next_hour % 24, 0, 0)
        .single()
        .unwrap_or(t);
    if next_hour == 24 {
        base + Duration::days(1)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn funding_times_every_eight_hours() {
        assert!(is_funding_time(at(0, 0)));
        assert!(is_funding_time(at(8, 0)));
        assert!(is_funding_time(at(16, 0)));
        assert!(!is_funding_time(at(1, 0)));
        assert!(!is_funding_time(at(8, 30)));
    }

    #[test]
    fn next_funding_time_steps_forward() {
        assert_eq!(next_funding_time(at(1, 30)).hour(), 8);
        assert_eq!(next_funding_time(at(9, 0)).hour(), 16);
        let rollover = next_funding_time(at(17, 0));
        assert_eq!(rollover.hour(), 0);
        assert_eq!(rollover.day(), 2);
    }

    #[test]
    fn boundary_crossing_between_bars() {
        // 07:30 -> 08:05 crosses the 08:00 boundary.
        assert!(crossed_funding_boundary(at(7, 30), at(8, 5)));
        // 08:05 -> 08:10 does not.
        assert!(!crossed_funding_boundary(at(8, 5), at(8, 10)));
        // Day rollover crosses 00:00.
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 23, 55, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 2, 0, 5, 0).unwrap();
        assert!(crossed_funding_boundary(before, after));
    }

    #[test]
    fn funding_at_time_picks_latest_applicable() {
        let rates = vec![
            FundingRate {
                timestamp: at(0, 0),
                symbol: "BTCUSD".into(),
                rate: 0.0001,
            },
            FundingRate {
                timestamp: at(8, 0),
                symbol: "BTCUSD".into(),
                rate: 0.0002,
            },
            FundingRate {
                timestamp: at(16, 0),
                symbol: "BTCUSD".into(),
                rate: 0.0003,
            },
        ];
        assert_eq!(funding_at_time(&rates, at(12, 0)), 0.0002);
        assert_eq!(funding_at_time(&rates, at(20, 0)), 0.0003);
    }

    #[test]
    fn synthetic_rates_are_deterministic_and_eight_hourly() {
        let start = at(0, 0);
        let end = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let a = generate_synthetic_rates("BTCUSD", start, end);
        let b = generate_synthetic_rates("BTCUSD", start, end);
        assert_eq!(a.len(), 6);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.rate, y.rate);
            assert!(x.rate > 0.0);
        }
    }
}
