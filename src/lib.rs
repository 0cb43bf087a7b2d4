//! Lumiere: Decoder Transformer Training Core
//!
//! Trains an autoregressive, decoder-only transformer language model on
//! tokenized text, on the CPU, with hand-written forward and backward passes.
//!
//! # Modules
//!
//! - [`positional`] - Sinusoidal positional encoding
//! - [`embedding`] - Token table plus positional signal
//! - [`layers`] - Linear, layer norm, dropout, attention, feed-forward, transformer block
//! - [`model`] - Model assembly and configuration
//! - [`loss`], [`gradients`], [`optimizer`], [`scheduler`] - Training math
//! - [`train`] - Epoch loop, multi-epoch driver, evaluation
//! - [`data`], [`tokenizer`] - Batch source and byte-level BPE
//! - [`report`] - Metric sinks
//! - [`device`] - Compute target (rayon pool)
//!
//! # Example
//!
//! ```rust,no_run
//! use lumiere::{
//!     fit, AdamW, BpeTokenizer, CsvReporter, Model, ModelConfig, TokenBatches,
//!     TrainingConfig, WarmupCosine,
//! };
//!
//! # fn main() -> lumiere::Result<()> {
//! let text = std::fs::read_to_string("corpus.txt")?;
//! let tokenizer = BpeTokenizer::train(text.lines(), 1000, 1024)?;
//!
//! let model_config = ModelConfig::tiny(tokenizer.vocab_size());
//! let config = TrainingConfig::tiny();
//! let batches = TokenBatches::from_text(
//!     &tokenizer,
//!     &text,
//!     config.batch_size,
//!     model_config.context_size + 1,
//! )?;
//!
//! let mut model = Model::new(&model_config)?;
//! let mut optimizer = AdamW::new(config.learning_rate, config.weight_decay);
//! let total_steps = config.max_epochs * batches.num_batches();
//! let mut scheduler = WarmupCosine::new(
//!     config.learning_rate,
//!     config.learning_rate * config.min_lr_ratio,
//!     config.warmup_steps,
//!     total_steps,
//! );
//! let mut reporter = CsvReporter::create("metrics.csv")?;
//!
//! let summaries = fit(
//!     &mut model,
//!     &mut optimizer,
//!     &mut scheduler,
//!     &batches,
//!     None,
//!     Some(&mut reporter),
//!     &config,
//! )?;
//! println!("final loss {:.4}", summaries[summaries.len() - 1].train.avg_loss);
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod device;
pub mod embedding;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod positional;
pub mod report;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;
pub mod train;

// Re-export main types for convenience
pub use data::{train_val_split, TokenBatches};
pub use device::Device;
pub use embedding::Embedding;
pub use error::{LumiereError, Result};
pub use gradients::{check_max_norm, clip_grad_norm, global_grad_norm};
pub use layers::{Mode, Param, Parameterized, SequenceBlock, TransformerBlock};
pub use loss::{cross_entropy, perplexity};
pub use model::{Model, ModelCache, ModelConfig};
pub use optimizer::{AdamW, Optimizer};
pub use positional::{sinusoidal_positional_encoding, EncodingShape, IntoEncodingShape};
pub use report::{CsvReporter, LogReporter, Metrics, MetricsReporter};
pub use scheduler::{ConstantLr, LrScheduler, WarmupCosine};
pub use tensor::{Tensor, TokenIds};
pub use tokenizer::BpeTokenizer;
pub use train::{
    evaluate, fit, train_epoch, EpochSettings, EpochSummary, EvalState, TrainingConfig,
    TrainingState,
};
