// Historical candle loading with a JSON file cache keyed by
// symbol_resolution_start_end. Fetches go through the venue client in
// bounded chunks; cached ranges never touch the network.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;

use crate::venue::client::Client;
use crate::venue::market::resolution_duration;
use crate::venue::types::Candle;

/// Maximum candles requested per REST call.
const FETCH_CHUNK: usize = 2000;

pub struct DataLoader {
    client: Option<Arc<Client>>,
    cache_dir: PathBuf,
}

impl DataLoader {
    pub fn new(client: Option<Arc<Client>>, cache_dir: &str) -> Self {
        Self {
            client,
            cache_dir: PathBuf::from(cache_dir),
        }
    }

    /// Loads candles for the range, preferring the cache. Fetched data is
    /// written back for the next run.
    pub async fn load_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        if let Ok(cached) = self.load_from_cache(symbol, resolution, start, end) {
            if !cached.is_empty() {
                info!("loaded {} cached candles for {symbol}", cached.len());
                return Ok(cached);
            }
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("no cached candles for {symbol} and no client configured"))?;

        let step = resolution_duration(resolution)
            .ok_or_else(|| anyhow!("unknown resolution: {resolution}"))?;
        let chunk = chrono::Duration::from_std(step * FETCH_CHUNK as u32)
            .context("chunk duration out of range")?;

        let mut candles = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let chunk_end = (cursor + chunk).min(end);
            let mut batch = client
                .get_candles(symbol, resolution, cursor, chunk_end)
                .await
                .map_err(|e| anyhow!("fetch candles for {symbol}: {e}"))?;
            batch.sort_by_key(|c| c.time);
            candles.extend(batch);
            cursor = chunk_end;
        }

        candles.sort_by_key(|c| c.time);
        candles.dedup_by_key(|c| c.time);

        if let Err(err) = self.save_to_cache(symbol, resolution, start, end, &candles) {
            log::warn!("failed to cache candles for {symbol}: {err}");
        }
        Ok(candles)
    }

    /// Seeds the cache directly; used by replay scenarios with synthetic
    /// data.
    pub fn store_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        candles: &[Candle],
    ) -> Result<()> {
        self.save_to_cache(symbol, resolution, start, end, candles)
    }

    fn cache_file_path(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PathBuf {
        let name = format!(
            "{symbol}_{resolution}_{}_{}.json",
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        );
        self.cache_dir.join(name)
    }

    fn load_from_cache(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let path = self.cache_file_path(symbol, resolution, start, end);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read candle cache {}", path.display()))?;
        serde_json::from_str(&data).context("parse candle cache")
    }

    fn save_to_cache(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        candles: &[Candle],
    ) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).context("create candle cache dir")?;
        let path = self.cache_file_path(symbol, resolution, start, end);
        let data = serde_json::to_string(candles).context("serialize candles")?;
        fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cache_round_trips() {
        let dir = std::env::temp_dir().join(format!("candle-cache-{}", std::process::id()));
        let loader = DataLoader::new(None, dir.to_str().unwrap());

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle {
                time: start.timestamp() + i * 300,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1.0,
            })
            .collect();

        loader
            .store_candles("BTCUSD", "5m", start, end, &candles)
            .unwrap();
        let loaded = loader.load_from_cache("BTCUSD", "5m", start, end).unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded[3].time, candles[3].time);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_cache_without_client_errors() {
        let dir = std::env::temp_dir().join(format!("candle-cache-miss-{}", std::process::id()));
        let loader = DataLoader::new(None, dir.to_str().unwrap());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(loader.load_candles("BTCUSD", "5m", start, end));
        assert!(result.is_err());
    }
}
