// Request signing for the venue API.
// Signature format: HMAC-SHA256 over method + timestamp + path + "?" + query + body.

use anyhow::{anyhow, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const USER_AGENT: &str = "perpbot/0.2";

/// Maximum age the venue accepts for a request timestamp.
pub const TIMESTAMP_WINDOW_SECS: i64 = 5;

/// Computes the hex HMAC-SHA256 signature over the canonical request string.
/// The query string is appended with a leading '?' only when non-empty.
pub fn generate_signature(
    secret: &str,
    method: &str,
    timestamp: &str,
    path: &str,
    query_string: &str,
    body: &str,
) -> String {
    let mut message = String::with_capacity(
        method.len() + timestamp.len() + path.len() + query_string.len() + body.len() + 1,
    );
    message.push_str(method);
    message.push_str(timestamp);
    message.push_str(path);
    if !query_string.is_empty() {
        message.push('?');
        message.push_str(query_string);
    }
    message.push_str(body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn generate_timestamp() -> String {
    Utc::now().timestamp().to_string()
}

/// Authentication headers attached to every signed request.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
    pub user_agent: String,
}

impl AuthHeaders {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        method: &str,
        path: &str,
        query_string: &str,
        body: &str,
    ) -> Self {
        let timestamp = generate_timestamp();
        let signature =
            generate_signature(api_secret, method, &timestamp, path, query_string, body);
        Self {
            api_key: api_key.to_string(),
            signature,
            timestamp,
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Checks the timestamp is still within the venue's validity window.
    pub fn validate(&self) -> Result<()> {
        let ts: i64 = self
            .timestamp
            .parse()
            .map_err(|e| anyhow!("invalid timestamp: {e}"))?;
        let age = Utc::now().timestamp() - ts;
        if age > TIMESTAMP_WINDOW_SECS {
            return Err(anyhow!("timestamp expired: {age} seconds old"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_docs_example() {
        let got = generate_signature(
            "7b6f39dcf660ec1c7c664f612c60410a2bd0c258416b498bf0311f94228f",
            "GET",
            "1542110948",
            "/v2/orders",
            "product_id=1&state=open",
            "",
        );
        assert_eq!(
            got,
            "4e38dda3e6477092f360ba70399266d8145630b22bcc34c0ec7f804d5746877a"
        );
    }

    #[test]
    fn empty_query_omits_question_mark() {
        let with_empty = generate_signature("s", "POST", "1", "/v2/orders", "", "{}");
        let with_query = generate_signature("s", "POST", "1", "/v2/orders", "a=b", "{}");
        assert_ne!(with_empty, with_query);
    }

    #[test]
    fn fresh_headers_validate() {
        let headers = AuthHeaders::new("k", "s", "GET", "/v2/products", "", "");
        assert!(headers.validate().is_ok());
    }
}
