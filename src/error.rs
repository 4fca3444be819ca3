use thiserror::Error;

/// Errors raised by the text-correction library.
#[derive(Error, Debug)]
pub enum Error {
    /// An invalid model or training configuration (fatal at construction time).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sequence is longer than the precomputed positional-encoding table.
    #[error("sequence length {len} exceeds positional encoding table of {max} positions")]
    SequenceTooLong { len: i64, max: i64 },

    /// Two tensors or collections that must agree in shape do not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    /// The orchestrator was used before `compile` built the models.
    #[error("model is not compiled; call compile() or load_checkpoint() first")]
    NotCompiled,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("unknown correction strategy `{0}` (expected similarity, norvig or symspell)")]
    UnknownStrategy(String),

    #[error("corpus not loaded; call read_corpus() first")]
    CorpusNotLoaded,

    /// The background batch producer finished before the consumer was done.
    #[error("batch producer closed after {received} of {expected} batches")]
    ProducerClosed { received: usize, expected: usize },

    #[error("malformed M2 data at line {line}: {message}")]
    M2Parse { line: usize, message: String },

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
