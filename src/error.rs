use thiserror::Error;

/// Typed failure modes for the memory engine. The CLI boundary wraps these in
/// `anyhow::Result` and decides fatal-vs-recoverable per §7 of the design doc;
/// this enum itself makes no process-exit decisions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid model file: {0}")]
    InvalidModel(String),

    #[error("invalid tokenizer file: {0}")]
    InvalidTokenizer(String),

    #[error("index is full (capacity {0})")]
    Full(usize),

    #[error("no record with id {0}")]
    NotFound(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("gpu initialization failed: {0}")]
    GpuInit(String),

    #[error("gpu dispatch failed: {0}")]
    GpuDispatch(String),

    #[error("could not parse filter expression: {0}")]
    FilterParse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
