pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod generation;
pub mod layers;
pub mod logging;
pub mod m2;
pub mod metrics;
pub mod model;
pub mod prefetch;
pub mod preproc;
pub mod schedule;
pub mod statistical;
pub mod tokenizer;
pub mod training;
pub mod transform;

#[cfg(test)]
mod test_util;

pub use callbacks::{get_callbacks, Callback};
pub use config::{Config, ModelConfig, TrainingConfig};
pub use data::{Batch, DataGenerator};
pub use error::{Error, Result};
pub use layers::{DecoderLayer, EncoderLayer, FeedForward, MultiHeadAttention, PositionalEncoding};
pub use model::{Decoder, Encoder, Transformer};
pub use schedule::CustomSchedule;
pub use statistical::{LanguageModel, Strategy};
pub use tokenizer::{CharsetTokenizer, HfTokenizer, TextTokenizer};
pub use training::{FitOptions, History};
pub use transform::{Partitions, Transform};
