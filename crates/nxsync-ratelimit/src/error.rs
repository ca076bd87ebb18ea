#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LimiterError {
    #[error("fill rate must be a positive, finite number of tokens per second (got {0})")]
    InvalidRate(f64),
    #[error("capacity must be a positive, finite number of tokens (got {0})")]
    InvalidCapacity(f64),
    #[error("refilling {buffer_bytes} bytes at {fill_rate} tokens per second is not a representable delay")]
    InvalidDelay { buffer_bytes: usize, fill_rate: f64 },
    #[error("unknown fairness strategy: {0}")]
    UnknownStrategy(String),
}
