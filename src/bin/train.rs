//! Train a decoder transformer on a text file
//!
//! ## Usage
//!
//! ```bash
//! # Train a tiny model on a corpus, logging metrics to CSV
//! cargo run --release --bin lumiere-train -- --data corpus.txt --metrics metrics.csv
//!
//! # Reuse a trained tokenizer and a training config file
//! cargo run --release --bin lumiere-train -- \
//!     --data corpus.txt --tokenizer tokenizer.json --config train.json --epochs 3
//!
//! # Print the resolved configuration and exit
//! cargo run --release --bin lumiere-train -- --preset small --dump-config
//! ```
//!
//! Set `RUST_LOG=debug` for per-batch progress.

use std::fs;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lumiere::{
    fit, train_val_split, AdamW, BpeTokenizer, CsvReporter, Device, LogReporter, MetricsReporter,
    Model, ModelConfig, Parameterized, TokenBatches, TrainingConfig, WarmupCosine,
};

#[derive(Parser)]
#[command(
    name = "lumiere-train",
    about = "Train a decoder-only transformer language model on a text corpus"
)]
struct Args {
    /// Path to training text file
    #[arg(long, default_value = "corpus.txt")]
    data: String,

    /// Training configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<String>,

    /// Model configuration (JSON); vocab_size is always taken from the tokenizer
    #[arg(long, conflicts_with = "preset")]
    model_config: Option<String>,

    /// Named model preset: tiny, small or default
    #[arg(long, default_value = "tiny")]
    preset: String,

    /// Load tokenizer from file instead of training one
    #[arg(long)]
    tokenizer: Option<String>,

    /// Save the freshly trained tokenizer here
    #[arg(long)]
    save_tokenizer: Option<String>,

    /// Target vocabulary size when training a tokenizer
    #[arg(long, default_value = "1024")]
    vocab: usize,

    /// Lines per tokenizer training chunk
    #[arg(long, default_value = "1000")]
    tokenizer_batch_size: usize,

    /// Write metrics to this CSV file (otherwise they are logged)
    #[arg(long)]
    metrics: Option<String>,

    // Training overrides
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Sequences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Gradient clipping max norm
    #[arg(long)]
    grad_clip: Option<f32>,

    /// Worker threads (1 = single-threaded CPU)
    #[arg(long)]
    threads: Option<usize>,

    /// Seed for initialization and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,
}

fn training_config(args: &Args) -> Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json_file(path)
            .with_context(|| format!("Failed to load training config from {}", path))?,
        None => TrainingConfig::tiny(),
    };
    if let Some(epochs) = args.epochs {
        config.max_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if let Some(clip) = args.grad_clip {
        config.gradient_clip_norm = clip;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    match args.threads {
        Some(1) => config.device = Device::Cpu,
        Some(threads) => config.device = Device::Parallel { threads: Some(threads) },
        None => {}
    }
    config.validate()?;
    Ok(config)
}

fn model_config(args: &Args, vocab_size: usize) -> Result<ModelConfig> {
    let mut config = match &args.model_config {
        Some(path) => ModelConfig::from_json_file(path)
            .with_context(|| format!("Failed to load model config from {}", path))?,
        None => ModelConfig::preset(&args.preset, vocab_size)?,
    };
    if config.vocab_size != vocab_size {
        log::warn!(
            "Model vocab_size {} replaced by tokenizer vocab_size {}",
            config.vocab_size,
            vocab_size
        );
        config.vocab_size = vocab_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let training = training_config(&args)?;

    if args.dump_config {
        let vocab_size = match &args.tokenizer {
            Some(path) => BpeTokenizer::load(path)?.vocab_size(),
            None => args.vocab,
        };
        let resolved = serde_json::json!({
            "model": model_config(&args, vocab_size)?,
            "training": training,
        });
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    // 1. Data
    let text = fs::read_to_string(&args.data)
        .with_context(|| format!("Failed to read training data from {}", args.data))?;
    log::info!(
        "Loaded {} ({:.2} MB, {} characters)",
        args.data,
        text.len() as f64 / 1_000_000.0,
        text.chars().count()
    );

    // 2. Tokenizer
    let tokenizer = match &args.tokenizer {
        Some(path) => {
            let tokenizer = BpeTokenizer::load(path)
                .with_context(|| format!("Failed to load tokenizer from {}", path))?;
            log::info!("Loaded tokenizer: {} tokens", tokenizer.vocab_size());
            tokenizer
        }
        None => {
            let tokenizer = BpeTokenizer::train(text.lines(), args.tokenizer_batch_size, args.vocab)?;
            if let Some(path) = &args.save_tokenizer {
                tokenizer.save(path)?;
                log::info!("Saved tokenizer to {}", path);
            }
            tokenizer
        }
    };

    let tokens = tokenizer.encode(&text);
    log::info!("Corpus: {} tokens", tokens.len());

    // 3. Model
    let model_config = model_config(&args, tokenizer.vocab_size())?;
    let window = model_config.context_size + 1;
    let (train_tokens, val_tokens) = train_val_split(&tokens, training.validation_fraction)?;
    let train_batches = TokenBatches::new(train_tokens.to_vec(), training.batch_size, window)?;
    let val_batches = TokenBatches::new(val_tokens.to_vec(), training.batch_size, window)?;
    if train_batches.is_empty() {
        bail!(
            "Not enough training tokens ({}) for one batch of {} x {}",
            train_batches.num_tokens(),
            training.batch_size,
            window
        );
    }

    let mut model = Model::new(&model_config)?;
    let num_params = model.num_parameters();
    log::info!(
        "Model: {} layers, {} heads, embedding {}, context {}, {} parameters ({:.2}M)",
        model_config.num_layers,
        model_config.num_heads,
        model_config.embedding_size,
        model_config.context_size,
        num_params,
        num_params as f64 / 1_000_000.0
    );

    // 4. Optimizer and schedule
    let mut optimizer = AdamW::new(training.learning_rate, training.weight_decay);
    let total_steps = training.max_epochs * train_batches.num_batches();
    let mut scheduler = WarmupCosine::new(
        training.learning_rate,
        training.learning_rate * training.min_lr_ratio,
        training.warmup_steps,
        total_steps,
    );

    let mut reporter: Box<dyn MetricsReporter + Send> = match &args.metrics {
        Some(path) => Box::new(
            CsvReporter::create(path)
                .with_context(|| format!("Failed to create metrics file {}", path))?,
        ),
        None => Box::new(LogReporter),
    };

    // 5. Train
    let pool = training.device.thread_pool()?;
    log::info!(
        "Training on {:?} ({} worker threads), {} steps",
        training.device,
        pool.current_num_threads(),
        total_steps
    );
    let summaries = pool.install(|| {
        let reporter: &mut dyn MetricsReporter = reporter.as_mut();
        let validation = (!val_batches.is_empty()).then_some(&val_batches);
        fit(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &train_batches,
            validation,
            Some(reporter),
            &training,
        )
    })?;

    if let Some(last) = summaries.last() {
        log::info!(
            "Finished {} epochs, {} steps | final train loss {:.4} (perplexity {:.2})",
            summaries.len(),
            last.train.global_step,
            last.train.avg_loss,
            last.train.avg_perplexity
        );
        if let Some(val) = last.validation {
            log::info!(
                "Final validation loss {:.4} (perplexity {:.2})",
                val.avg_loss,
                val.avg_perplexity
            );
        }
    }

    Ok(())
}
