use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("failed to encode queue message: {0}")]
    Encode(#[from] serde_json::Error),
}
