// Stateless request/response core for the venue REST API.
// Token-bucket rate limiting, HMAC signing, and a three-attempt retry ladder:
// transport errors and 5xx back off linearly, 429 honors Retry-After,
// other 4xx surface immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::warn;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};

use crate::config::Config;

use super::auth::AuthHeaders;
use super::error::VenueError;

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Token bucket issuing at most `rps` request permits per second.
pub struct RateLimiter {
    ticker: Mutex<Interval>,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Self {
        let rps = rps.max(1);
        let mut ticker = interval(Duration::from_secs_f64(1.0 / rps as f64));
        // Never burst to catch up after idle periods.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: Mutex::new(ticker),
        }
    }

    pub async fn acquire(&self) {
        self.ticker.lock().await.tick().await;
    }
}

/// Well-formed response envelope from the venue.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ApiResponse {
    pub fn parse_result<T: DeserializeOwned>(&self) -> Result<T, VenueError> {
        serde_json::from_value(self.result.clone()).map_err(|e| VenueError::Parse {
            reason: e.to_string(),
            body: truncate_body(&self.result.to_string()),
        })
    }
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_path_prefix: String,
    api_key: String,
    api_secret: String,
    limiter: RateLimiter,
    closed: AtomicBool,
}

impl Client {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");

        Self {
            http,
            api_path_prefix: extract_path_prefix(&cfg.base_url),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            limiter: RateLimiter::new(cfg.rate_limit_rps),
            closed: AtomicBool::new(false),
        }
    }

    /// Stops issuing requests. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn api_path_prefix(&self) -> &str {
        &self.api_path_prefix
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<ApiResponse, VenueError> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse, VenueError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn delete_with_body(&self, path: &str, body: &Value) -> Result<ApiResponse, VenueError> {
        self.request(Method::DELETE, path, &[], Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<ApiResponse, VenueError> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse, VenueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VenueError::Transport("client is closed".to_string()));
        }

        let query_string = encode_query(query);
        let url = if query_string.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query_string)
        };
        let signature_path = format!("{}{}", self.api_path_prefix, path);

        let body_str = match body {
            Some(b) => serde_json::to_string(b).map_err(|e| VenueError::Parse {
                reason: format!("marshal body: {e}"),
                body: String::new(),
            })?,
            None => String::new(),
        };

        let mut last_err = VenueError::Transport("request not attempted".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            self.limiter.acquire().await;

            let headers = AuthHeaders::new(
                &self.api_key,
                &self.api_secret,
                method.as_str(),
                &signature_path,
                &query_string,
                &body_str,
            );

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .header("api-key", &headers.api_key)
                .header("signature", &headers.signature)
                .header("timestamp", &headers.timestamp)
                .header("User-Agent", &headers.user_agent);
            if !body_str.is_empty() {
                req = req.body(body_str.clone());
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    last_err = err.into();
                    sleep(Duration::from_secs((attempt + 1) as u64)).await;
                    continue;
                }
            };

            let status = resp.status();
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let text = resp.text().await.map_err(|e| VenueError::Transport(e.to_string()))?;

            if status.as_u16() == 429 {
                warn!("VENUE: rate limited on {path}, attempt {}", attempt + 1);
                last_err = VenueError::RateLimited {
                    retry_after,
                    body: truncate_body(&text),
                };
                match retry_after {
                    Some(secs) if secs > 0 => sleep(Duration::from_secs(secs)).await,
                    _ => sleep(Duration::from_secs((attempt + 1) as u64)).await,
                }
                continue;
            }

            if status.is_server_error() {
                last_err = VenueError::Server {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                };
                sleep(Duration::from_secs((attempt + 1) as u64)).await;
                continue;
            }

            if !status.is_success() {
                return Err(VenueError::Client {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                });
            }

            let api_resp: ApiResponse =
                serde_json::from_str(&text).map_err(|e| VenueError::Parse {
                    reason: e.to_string(),
                    body: truncate_body(&text),
                })?;

            if !api_resp.success {
                return match api_resp.error {
                    Some(err) => Err(VenueError::Api {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Err(VenueError::Api {
                        code: "unknown".to_string(),
                        message: truncate_body(&text),
                    }),
                };
            }

            return Ok(api_resp);
        }

        Err(last_err)
    }
}

fn encode_query(query: &[(&str, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Extracts the versioned API prefix from the base URL ("/v2" by default).
/// The signature covers the full path including this prefix.
fn extract_path_prefix(base_url: &str) -> String {
    let rest = match base_url.find("://") {
        Some(idx) => &base_url[idx + 3..],
        None => base_url,
    };
    match rest.find('/') {
        Some(idx) => {
            let prefix = rest[idx..].trim_end_matches('/');
            if prefix.is_empty() {
                "/v2".to_string()
            } else {
                prefix.to_string()
            }
        }
        None => "/v2".to_string(),
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_path_prefix_from_base_url() {
        assert_eq!(extract_path_prefix("https://api.india.delta.exchange/v2"), "/v2");
        assert_eq!(extract_path_prefix("https://cdn-ind.testnet.deltaex.org/v2"), "/v2");
        assert_eq!(extract_path_prefix("https://example.com"), "/v2");
    }

    #[test]
    fn query_encoding_preserves_order() {
        let q = encode_query(&[("product_id", "1".to_string()), ("state", "open".to_string())]);
        assert_eq!(q, "product_id=1&state=open");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_issues_at_most_rps_per_second() {
        let limiter = RateLimiter::new(4);
        let start = tokio::time::Instant::now();
        // 9 permits at 4 rps: first is immediate, the rest are spaced 250ms.
        for _ in 0..9 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    }

    #[test]
    fn envelope_surfaces_error_code_and_message() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"success":false,"error":{"code":"insufficient_margin","message":"not enough"}}"#,
        )
        .unwrap();
        assert!(!resp.success);
        let err = resp.error.unwrap();
        assert_eq!(err.code, "insufficient_margin");
        assert_eq!(err.message, "not enough");
    }
}
