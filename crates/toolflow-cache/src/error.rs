use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("CACHE/ttl: time-to-live must be greater than zero")]
    InvalidTtl,

    #[error("CACHE/config: {0}")]
    Config(String),

    #[error("CACHE/io: {0}")]
    Io(#[from] std::io::Error),

    #[error("CACHE/serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("CACHE/unavailable: {0}")]
    Unavailable(String),
}
