use thiserror::Error;

/// Error taxonomy for the venue REST surface.
///
/// `Transport`, `RateLimited` and `Server` are retryable at the request
/// level; `Client`, `Parse` and `Api` are surfaced verbatim. `OrderRejected`
/// is produced by the execution layer and never triggers a market fallback.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {body}")]
    RateLimited {
        retry_after: Option<u64>,
        body: String,
    },

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("parse error: {reason} (body={body})")]
    Parse { reason: String, body: String },

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("order {order_id} rejected: {reason}")]
    OrderRejected { order_id: i64, reason: String },

    #[error("order {order_id} was cancelled")]
    OrderCancelled { order_id: i64 },

    #[error("order {order_id} in unexpected state: {state}")]
    UnexpectedOrderState { order_id: i64, state: String },

    #[error("cannot safely replace order {order_id}: {reason}")]
    UnsafeReplace { order_id: i64, reason: String },
}

impl VenueError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, VenueError::OrderRejected { .. })
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(err: reqwest::Error) -> Self {
        VenueError::Transport(err.to_string())
    }
}
