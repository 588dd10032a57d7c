// Regime oracle client: posts candle windows to the external classifier and
// returns a regime label with confidence. An identity token is fetched from
// the cloud metadata endpoint when available; without a metadata server the
// request proceeds unauthenticated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::info;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::venue::types::{Candle, Regime};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity";
/// Identity tokens last about an hour; the cache is cleared ten minutes
/// before that so a fresh one is fetched well ahead of expiry.
const TOKEN_REFRESH_AFTER: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegimeFeatures {
    #[serde(default)]
    pub volatility: f64,
    #[serde(default)]
    pub trend: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegimeResponse {
    pub regime: Regime,
    pub confidence: f64,
    #[serde(default)]
    pub features: RegimeFeatures,
}

pub struct OracleClient {
    endpoint: String,
    http: reqwest::Client,
    token_cache: Arc<RwLock<String>>,
}

impl OracleClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build http client"),
            token_cache: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Classifies the candle window for one symbol.
    pub async fn detect_regime(&self, candles: &[Candle], symbol: &str) -> Result<RegimeResponse> {
        let body = candles_to_oracle_input(candles, symbol);

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);

        if let Some(token) = self.identity_token().await? {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.context("regime oracle request")?;
        let status = resp.status();
        let text = resp.text().await.context("read oracle response")?;

        if !status.is_success() {
            return Err(anyhow!("regime oracle http {}: {}", status.as_u16(), text));
        }

        serde_json::from_str(&text).context("parse oracle response")
    }

    /// Retry wrapper with linear backoff; HTTP errors propagate after all
    /// attempts are exhausted.
    pub async fn detect_regime_with_retry(
        &self,
        candles: &[Candle],
        symbol: &str,
        max_retries: u32,
    ) -> Result<RegimeResponse> {
        let mut last_err = anyhow!("no attempts made");
        for attempt in 0..max_retries {
            match self.detect_regime(candles, symbol).await {
                Ok(resp) => return Ok(resp),
                Err(err) => last_err = err,
            }
            sleep(Duration::from_secs((attempt + 1) as u64)).await;
        }
        Err(anyhow!(
            "regime detection failed after {max_retries} retries: {last_err}"
        ))
    }

    /// Fetches (and caches) an identity token whose audience is the oracle
    /// endpoint. Returns `None` when no metadata server is reachable, in
    /// which case requests go out unauthenticated.
    async fn identity_token(&self) -> Result<Option<String>> {
        {
            let cached = self.token_cache.read().await;
            if !cached.is_empty() {
                return Ok(Some(cached.clone()));
            }
        }

        let metadata_url = format!("{METADATA_TOKEN_URL}?audience={}", self.endpoint);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build metadata client")?;

        let resp = match client
            .get(&metadata_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                // Not running on the cloud; proceed unauthenticated.
                info!("ORACLE: metadata server unreachable, skipping auth: {err}");
                return Ok(None);
            }
        };

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow!("metadata server returned {}", resp.status().as_u16()));
        }

        let token = resp.text().await.context("read identity token")?;

        {
            let mut cached = self.token_cache.write().await;
            *cached = token.clone();
        }

        // Background timer clears the cache before the token expires.
        let cache = self.token_cache.clone();
        tokio::spawn(async move {
            sleep(TOKEN_REFRESH_AFTER).await;
            cache.write().await.clear();
        });

        Ok(Some(token))
    }
}

/// Column-major candle arrays as the oracle expects them.
fn candles_to_oracle_input(candles: &[Candle], symbol: &str) -> serde_json::Value {
    let mut opens = Vec::with_capacity(candles.len());
    let mut highs = Vec::with_capacity(candles.len());
    let mut lows = Vec::with_capacity(candles.len());
    let mut closes = Vec::with_capacity(candles.len());
    let mut volumes = Vec::with_capacity(candles.len());
    let mut timestamps = Vec::with_capacity(candles.len());

    for c in candles {
        opens.push(c.open);
        highs.push(c.high);
        lows.push(c.low);
        closes.push(c.close);
        volumes.push(c.volume);
        timestamps.push(c.time);
    }

    json!({
        "symbol": symbol,
        "open": opens,
        "high": highs,
        "low": lows,
        "close": closes,
        "volume": volumes,
        "timestamp": timestamps,
    })
}
