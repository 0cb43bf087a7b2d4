//! Training Loop
//!
//! [`train_epoch`] runs exactly one pass over a batch source. For every batch,
//! strictly in order:
//!
//! ```text
//! 1. slice     batch [B, C+1] -> input [:, :-1], target [:, 1:]
//! 2. forward   logits [B, C, vocab]
//! 3. loss      cross-entropy over B·C positions, perplexity = exp(loss)
//! 4. backward  gradients into every Param
//! 5. clip      global-norm clip at gradient_clip_norm (pre-clip norm kept)
//! 6. step      optimizer.step, scheduler.step, zero_grad
//! 7. account   running loss/perplexity sums, num_batches += 1, global_step += 1
//! 8. report    every report_every global steps, if a reporter is supplied
//! ```
//!
//! Batch `n + 1` never starts before batch `n`'s update has been applied.
//! `global_step` is threaded in and out explicitly; the loop owns nothing but
//! its accumulators and the [`TrainingState`] it returns.
//!
//! [`fit`] drives several epochs (with optional validation) and [`evaluate`]
//! measures loss without touching the parameters.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::TokenBatches;
use crate::device::Device;
use crate::error::{LumiereError, Result};
use crate::gradients::{check_max_norm, clip_grad_norm};
use crate::layers::{Mode, Parameterized, SequenceBlock};
use crate::loss::{cross_entropy, perplexity};
use crate::model::Model;
use crate::optimizer::Optimizer;
use crate::report::{Metrics, MetricsReporter};
use crate::scheduler::LrScheduler;
use crate::tensor::TokenIds;

/// Training hyperparameters
///
/// # Common Configurations
///
/// - **tiny**: quick smoke runs (a few minutes on a laptop)
/// - **small**: short real runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Sequences per batch
    pub batch_size: usize,
    /// Number of passes through the training data
    pub max_epochs: usize,
    /// Peak learning rate (reached at the end of warmup)
    pub learning_rate: f32,
    /// Decoupled AdamW weight decay
    pub weight_decay: f32,
    /// Linear warmup length in optimizer steps
    pub warmup_steps: usize,
    /// Final learning rate as a fraction of the peak
    pub min_lr_ratio: f32,
    /// Global gradient-norm threshold
    pub gradient_clip_norm: f32,
    /// Emit metrics every N global steps
    pub report_every: usize,
    /// Fraction of tokens held out for validation
    pub validation_fraction: f32,
    /// Seed for dropout
    pub seed: u64,
    pub device: Device,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_epochs: 10,
            learning_rate: 3e-4,
            weight_decay: 0.01,
            warmup_steps: 100,
            min_lr_ratio: 0.1,
            gradient_clip_norm: 1.0,
            report_every: 50,
            validation_fraction: 0.1,
            seed: 0,
            device: Device::default(),
        }
    }
}

impl TrainingConfig {
    pub fn tiny() -> Self {
        Self {
            batch_size: 8,
            max_epochs: 3,
            learning_rate: 1e-3,
            warmup_steps: 20,
            ..Self::default()
        }
    }

    pub fn small() -> Self {
        Self {
            batch_size: 16,
            max_epochs: 5,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LumiereError::InvalidArgument(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.report_every == 0 {
            return Err(LumiereError::InvalidArgument(
                "report_every must be positive".to_string(),
            ));
        }
        check_max_norm(self.gradient_clip_norm)?;
        if !(self.learning_rate > 0.0) {
            return Err(LumiereError::InvalidArgument(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.min_lr_ratio) {
            return Err(LumiereError::InvalidArgument(format!(
                "min_lr_ratio must be in [0, 1], got {}",
                self.min_lr_ratio
            )));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(LumiereError::InvalidArgument(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Per-epoch knobs for [`train_epoch`]
#[derive(Clone, Debug)]
pub struct EpochSettings {
    /// 1-based epoch number, for progress output
    pub current_epoch: usize,
    pub max_epochs: usize,
    pub gradient_clip_norm: f32,
    pub report_every: usize,
    /// Dropout seed; mixed with the starting global step
    pub seed: u64,
}

impl EpochSettings {
    pub fn new(current_epoch: usize, max_epochs: usize, gradient_clip_norm: f32) -> Self {
        Self {
            current_epoch,
            max_epochs,
            gradient_clip_norm,
            report_every: 50,
            seed: 0,
        }
    }
}

/// Outcome of one training epoch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingState {
    pub avg_loss: f32,
    pub avg_perplexity: f32,
    pub num_batches: usize,
    /// Learning rate after the last scheduler step
    pub current_lr: f32,
    /// Cumulative step count across all epochs so far
    pub global_step: usize,
    /// Wall-clock time of the batch loop
    pub time_taken: Duration,
}

/// Outcome of an evaluation pass
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalState {
    pub avg_loss: f32,
    pub avg_perplexity: f32,
    pub num_batches: usize,
}

/// Training and validation results for one epoch of [`fit`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: TrainingState,
    pub validation: Option<EvalState>,
}

/// Train the model for one epoch
///
/// # Arguments
///
/// * `model` - Model whose parameters are updated in place
/// * `optimizer` - Applies the clipped gradients; its learning rate is set
///   from the scheduler before every batch
/// * `scheduler` - Stepped once per batch
/// * `batches` - `[batch, context_size + 1]` token batches
/// * `reporter` - Optional metric sink, called every `report_every` global steps
/// * `settings` - Epoch number, clip threshold, report cadence, dropout seed
/// * `global_step` - Steps completed before this epoch
///
/// # Errors
///
/// `InvalidArgument` before any batch is read if `gradient_clip_norm` is not
/// positive and finite. `EmptyEpoch` if `batches` yields nothing.
/// `NonFiniteLoss` as soon as a batch loss is NaN or infinite, and
/// `NonFiniteGradient` if the gradient norm is, before the optimizer runs.
/// Any shape or token-range error from the model.
/// A failing reporter is logged and does not stop training.
pub fn train_epoch<B, O, S, I>(
    model: &mut Model<B>,
    optimizer: &mut O,
    scheduler: &mut S,
    batches: I,
    mut reporter: Option<&mut (dyn MetricsReporter + '_)>,
    settings: &EpochSettings,
    global_step: usize,
) -> Result<TrainingState>
where
    B: SequenceBlock,
    O: Optimizer + ?Sized,
    S: LrScheduler + ?Sized,
    I: IntoIterator<Item = TokenIds>,
{
    check_max_norm(settings.gradient_clip_norm)?;

    let mut global_step = global_step;
    let mut total_loss = 0.0f64;
    let mut total_perplexity = 0.0f64;
    let mut num_batches = 0usize;
    let mut current_lr = scheduler.learning_rate();
    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(global_step as u64));

    log::info!("Epoch {}/{}", settings.current_epoch, settings.max_epochs);
    let start_time = Instant::now();

    for batch in batches {
        let window = batch.seq_len();
        let inputs = batch.slice_last(0, window.saturating_sub(1))?;
        let targets = batch.slice_last(1, window)?;

        optimizer.set_learning_rate(scheduler.learning_rate());
        let (logits, cache) = model.forward(&inputs, Mode::Train, &mut rng)?;
        let (batch_loss, grad_logits) = cross_entropy(&logits, &targets)?;
        if !batch_loss.is_finite() {
            return Err(LumiereError::NonFiniteLoss {
                step: global_step + 1,
                loss: batch_loss,
            });
        }
        let batch_perplexity = perplexity(batch_loss);

        model.backward(&grad_logits, &cache);
        let mut params = model.parameters_mut();
        let grad_norm = clip_grad_norm(&mut params, settings.gradient_clip_norm)?;
        if !grad_norm.is_finite() {
            return Err(LumiereError::NonFiniteGradient {
                step: global_step + 1,
                norm: grad_norm,
            });
        }
        optimizer.step(&mut params);
        scheduler.step();
        optimizer.zero_grad(&mut params);

        total_loss += batch_loss as f64;
        total_perplexity += batch_perplexity as f64;
        num_batches += 1;
        global_step += 1;
        current_lr = scheduler.learning_rate();

        log::debug!(
            "loss={:.4} perplexity={:.4} lr={:.2e} grad_norm={:.2} epoch_steps={}",
            batch_loss,
            batch_perplexity,
            current_lr,
            grad_norm,
            num_batches
        );

        if let Some(reporter) = reporter.as_mut() {
            if settings.report_every > 0 && global_step % settings.report_every == 0 {
                let metrics = Metrics::from([
                    ("train/loss", batch_loss),
                    ("train/perplexity", batch_perplexity),
                    ("train/lr", current_lr),
                    ("train/grad_norm", grad_norm),
                ]);
                if let Err(e) = reporter.report(global_step, &metrics) {
                    log::warn!("Metric reporting failed at step {}: {}", global_step, e);
                }
            }
        }
    }

    let time_taken = start_time.elapsed();
    if num_batches == 0 {
        return Err(LumiereError::EmptyEpoch);
    }

    Ok(TrainingState {
        avg_loss: (total_loss / num_batches as f64) as f32,
        avg_perplexity: (total_perplexity / num_batches as f64) as f32,
        num_batches,
        current_lr,
        global_step,
        time_taken,
    })
}

/// Average loss and perplexity with dropout disabled and no parameter update
///
/// # Errors
///
/// `EmptyEpoch` if `batches` yields nothing.
pub fn evaluate<B, I>(model: &Model<B>, batches: I) -> Result<EvalState>
where
    B: SequenceBlock,
    I: IntoIterator<Item = TokenIds>,
{
    // Eval mode never draws from it
    let mut rng = StdRng::seed_from_u64(0);
    let mut total_loss = 0.0f64;
    let mut total_perplexity = 0.0f64;
    let mut num_batches = 0usize;

    for batch in batches {
        let window = batch.seq_len();
        let inputs = batch.slice_last(0, window.saturating_sub(1))?;
        let targets = batch.slice_last(1, window)?;
        let (logits, _) = model.forward(&inputs, Mode::Eval, &mut rng)?;
        let (loss, _) = cross_entropy(&logits, &targets)?;
        total_loss += loss as f64;
        total_perplexity += perplexity(loss) as f64;
        num_batches += 1;
    }

    if num_batches == 0 {
        return Err(LumiereError::EmptyEpoch);
    }
    Ok(EvalState {
        avg_loss: (total_loss / num_batches as f64) as f32,
        avg_perplexity: (total_perplexity / num_batches as f64) as f32,
        num_batches,
    })
}

/// Train for `config.max_epochs` epochs, validating after each one
///
/// Validation metrics (`val/loss`, `val/perplexity`) go to the reporter at the
/// epoch's final global step. An empty validation source is skipped.
pub fn fit<B, O, S>(
    model: &mut Model<B>,
    optimizer: &mut O,
    scheduler: &mut S,
    train: &TokenBatches,
    validation: Option<&TokenBatches>,
    mut reporter: Option<&mut (dyn MetricsReporter + '_)>,
    config: &TrainingConfig,
) -> Result<Vec<EpochSummary>>
where
    B: SequenceBlock,
    O: Optimizer + ?Sized,
    S: LrScheduler + ?Sized,
{
    config.validate()?;
    log::info!(
        "Training {} parameters for {} epochs ({} batches per epoch)",
        model.num_parameters(),
        config.max_epochs,
        train.num_batches()
    );

    let mut summaries = Vec::with_capacity(config.max_epochs);
    let mut global_step = 0;

    for epoch in 1..=config.max_epochs {
        let settings = EpochSettings {
            current_epoch: epoch,
            max_epochs: config.max_epochs,
            gradient_clip_norm: config.gradient_clip_norm,
            report_every: config.report_every,
            seed: config.seed,
        };
        let state = train_epoch(
            model,
            optimizer,
            scheduler,
            train,
            reporter.as_deref_mut(),
            &settings,
            global_step,
        )?;
        global_step = state.global_step;

        log::info!(
            "Epoch {}/{} | Loss: {:.4} | Perplexity: {:.2} | LR: {:.2e} | {} batches in {:.1}s",
            epoch,
            config.max_epochs,
            state.avg_loss,
            state.avg_perplexity,
            state.current_lr,
            state.num_batches,
            state.time_taken.as_secs_f32()
        );

        let val_state = match validation {
            Some(batches) if !batches.is_empty() => {
                let eval = evaluate(model, batches)?;
                log::info!(
                    "Validation | Loss: {:.4} | Perplexity: {:.2}",
                    eval.avg_loss,
                    eval.avg_perplexity
                );
                if let Some(reporter) = reporter.as_mut() {
                    let metrics = Metrics::from([
                        ("val/loss", eval.avg_loss),
                        ("val/perplexity", eval.avg_perplexity),
                    ]);
                    if let Err(e) = reporter.report(global_step, &metrics) {
                        log::warn!("Metric reporting failed at step {}: {}", global_step, e);
                    }
                }
                Some(eval)
            }
            _ => None,
        };

        summaries.push(EpochSummary {
            epoch,
            train: state,
            validation: val_state,
        });
    }

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedding;
    use crate::gradients::global_grad_norm;
    use crate::layers::Param;
    use crate::model::ModelConfig;
    use crate::optimizer::AdamW;
    use crate::scheduler::{ConstantLr, WarmupCosine};
    use crate::tensor::Tensor;

    const VOCAB: usize = 7;
    const CONTEXT: usize = 4;

    fn tiny_model() -> Model {
        let config = ModelConfig {
            num_heads: 2,
            d_key: 4,
            d_value: 4,
            d_ff: 16,
            num_layers: 1,
            dropout: 0.1,
            ..ModelConfig::new(VOCAB, 8, CONTEXT)
        };
        Model::new(&config).unwrap()
    }

    /// Cyclic 0..VOCAB token stream, batched into `[batch_size, CONTEXT + 1]`
    fn cyclic_batches(num_tokens: usize, batch_size: usize) -> TokenBatches {
        let tokens = (0..num_tokens).map(|i| (i % VOCAB) as i64).collect();
        TokenBatches::new(tokens, batch_size, CONTEXT + 1).unwrap()
    }

    #[derive(Default)]
    struct RecordingReporter {
        calls: Vec<(usize, Metrics)>,
    }

    impl MetricsReporter for RecordingReporter {
        fn report(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
            self.calls.push((step, metrics.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingReporter {
        attempts: usize,
    }

    impl MetricsReporter for FailingReporter {
        fn report(&mut self, _step: usize, _metrics: &Metrics) -> Result<()> {
            self.attempts += 1;
            Err(LumiereError::Report("backend unavailable".to_string()))
        }
    }

    /// Records the gradient norm it is handed instead of updating anything
    #[derive(Default)]
    struct RecordingOptimizer {
        lr: f32,
        observed_norms: Vec<f32>,
        steps: usize,
    }

    impl Optimizer for RecordingOptimizer {
        fn step(&mut self, params: &mut [&mut Param]) {
            self.observed_norms.push(global_grad_norm(params));
            self.steps += 1;
        }

        fn learning_rate(&self) -> f32 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f32) {
            self.lr = lr;
        }
    }

    /// Identity on the way forward, scales the gradient on the way back
    struct GradientAmplifier {
        gain: f32,
    }

    impl Parameterized for GradientAmplifier {
        fn parameters(&self) -> Vec<&Param> {
            Vec::new()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Param> {
            Vec::new()
        }
    }

    impl SequenceBlock for GradientAmplifier {
        type Cache = ();

        fn forward(&self, x: &Tensor, _mode: Mode, _rng: &mut StdRng) -> (Tensor, ()) {
            (x.clone(), ())
        }

        fn backward(&mut self, grad_out: &Tensor, _cache: &()) -> Tensor {
            grad_out.mul_scalar(self.gain)
        }
    }

    fn settings(report_every: usize) -> EpochSettings {
        EpochSettings {
            report_every,
            ..EpochSettings::new(1, 1, 1.0)
        }
    }

    #[test]
    fn test_counts_and_global_step_threading() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.01);
        let mut scheduler = WarmupCosine::new(1e-3, 1e-4, 2, 20);
        let batches = cyclic_batches(60, 2);
        assert!(batches.num_batches() > 0);

        let state = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &batches,
            None,
            &settings(50),
            10,
        )
        .unwrap();

        assert_eq!(state.num_batches, batches.num_batches());
        assert_eq!(state.global_step, 10 + batches.num_batches());
        assert_eq!(scheduler.current_step(), batches.num_batches());
        assert_eq!(state.current_lr, scheduler.learning_rate());
        assert_eq!(optimizer.step, batches.num_batches());
        assert!(state.avg_loss.is_finite() && state.avg_loss > 0.0);
        // gradients are cleared after every update
        assert!(model.parameters().iter().all(|p| p.grad.data.iter().all(|&g| g == 0.0)));
    }

    #[test]
    fn test_averages_match_observed_batches() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);
        let mut reporter = RecordingReporter::default();

        let state = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &cyclic_batches(100, 2),
            Some(&mut reporter),
            &settings(1),
            0,
        )
        .unwrap();

        assert_eq!(reporter.calls.len(), state.num_batches);
        let losses: Vec<f32> = reporter.calls.iter().map(|(_, m)| m["train/loss"]).collect();
        let perplexities: Vec<f32> = reporter
            .calls
            .iter()
            .map(|(_, m)| m["train/perplexity"])
            .collect();
        let mean = |v: &[f32]| v.iter().map(|&x| x as f64).sum::<f64>() / v.len() as f64;

        assert!((state.avg_loss as f64 - mean(&losses)).abs() < 1e-5);
        assert!((state.avg_perplexity as f64 - mean(&perplexities)).abs() < 1e-4);
        for (_, metrics) in &reporter.calls {
            assert!((metrics["train/perplexity"] - metrics["train/loss"].exp()).abs() < 1e-4);
            assert_eq!(metrics.len(), 4);
        }
    }

    #[test]
    fn test_reports_only_on_multiples_of_report_every() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);
        let mut reporter = RecordingReporter::default();
        // 12 single-sequence batches: global steps 46..=57
        let batches = cyclic_batches(49, 1);
        assert_eq!(batches.num_batches(), 12);

        train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &batches,
            Some(&mut reporter),
            &settings(50),
            45,
        )
        .unwrap();

        let steps: Vec<usize> = reporter.calls.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![50]);
        assert_eq!(reporter.calls[0].1["train/lr"], 1e-3);
    }

    #[test]
    fn test_failing_reporter_does_not_stop_training() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);
        let mut reporter = FailingReporter::default();
        let batches = cyclic_batches(60, 2);

        let state = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &batches,
            Some(&mut reporter),
            &settings(1),
            0,
        )
        .unwrap();

        assert_eq!(reporter.attempts, batches.num_batches());
        assert_eq!(state.num_batches, batches.num_batches());
        assert!(state.avg_loss.is_finite());
    }

    #[test]
    fn test_empty_epoch_is_an_error() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);

        let result = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            Vec::<TokenIds>::new(),
            None,
            &settings(50),
            7,
        );
        assert!(matches!(result, Err(LumiereError::EmptyEpoch)));
        assert_eq!(optimizer.step, 0);
    }

    #[test]
    fn test_clipped_gradient_never_exceeds_threshold() {
        let mut rng = StdRng::seed_from_u64(3);
        let embedding = Embedding::new(VOCAB, CONTEXT, 8, &mut rng).unwrap();
        let blocks = vec![
            GradientAmplifier { gain: 1e3 },
            GradientAmplifier { gain: 1e3 },
        ];
        let mut model = Model::with_blocks(embedding, blocks, &mut rng);
        let mut optimizer = RecordingOptimizer::default();
        let mut scheduler = ConstantLr::new(1e-3);
        let mut reporter = RecordingReporter::default();
        let clip = 0.5;

        let state = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &cyclic_batches(60, 2),
            Some(&mut reporter),
            &EpochSettings {
                report_every: 1,
                ..EpochSettings::new(1, 1, clip)
            },
            0,
        )
        .unwrap();

        assert_eq!(optimizer.steps, state.num_batches);
        assert_eq!(optimizer.lr, 1e-3);
        for (_, metrics) in &reporter.calls {
            assert!(metrics["train/grad_norm"] > 100.0 * clip);
        }
        for norm in &optimizer.observed_norms {
            assert!(*norm <= clip * (1.0 + 1e-4), "applied norm {} > {}", norm, clip);
        }
    }

    #[test]
    fn test_non_finite_loss_fails_loudly() {
        let mut model = tiny_model();
        model.linear_out.bias.value.data[0] = f32::NAN;
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);

        let result = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &cyclic_batches(60, 2),
            None,
            &settings(50),
            4,
        );
        assert!(matches!(result, Err(LumiereError::NonFiniteLoss { step: 5, .. })));
    }

    #[test]
    fn test_rejects_non_positive_clip_norm() {
        for clip in [-1.0, 0.0, f32::NAN, f32::INFINITY] {
            let mut model = tiny_model();
            let before: Vec<Tensor> =
                model.parameters().iter().map(|p| p.value.clone()).collect();
            let mut optimizer = AdamW::new(1e-3, 0.0);
            let mut scheduler = ConstantLr::new(1e-3);

            let result = train_epoch(
                &mut model,
                &mut optimizer,
                &mut scheduler,
                &cyclic_batches(60, 2),
                None,
                &EpochSettings::new(1, 1, clip),
                0,
            );
            assert!(
                matches!(result, Err(LumiereError::InvalidArgument(_))),
                "clip {} accepted",
                clip
            );
            assert_eq!(optimizer.step, 0);
            assert_eq!(scheduler.current_step(), 0);
            for (p, old) in model.parameters().iter().zip(&before) {
                assert_eq!(&p.value, old);
            }
        }
    }

    #[test]
    fn test_non_finite_gradient_stops_before_update() {
        let mut rng = StdRng::seed_from_u64(8);
        let embedding = Embedding::new(VOCAB, CONTEXT, 8, &mut rng).unwrap();
        let blocks = vec![GradientAmplifier { gain: f32::INFINITY }];
        let mut model = Model::with_blocks(embedding, blocks, &mut rng);
        let mut optimizer = RecordingOptimizer::default();
        let mut scheduler = ConstantLr::new(1e-3);

        let result = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &cyclic_batches(60, 2),
            None,
            &settings(50),
            3,
        );
        assert!(matches!(
            result,
            Err(LumiereError::NonFiniteGradient { step: 4, .. })
        ));
        assert_eq!(optimizer.steps, 0);
    }

    #[test]
    fn test_bad_tokens_propagate() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = ConstantLr::new(1e-3);
        let batch = TokenIds::new(vec![0, 1, 2, 3, 99], vec![1, 5]).unwrap();

        let result = train_epoch(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            vec![batch],
            None,
            &settings(50),
            0,
        );
        assert!(matches!(result, Err(LumiereError::TokenOutOfRange { token: 99, .. })));
    }

    #[test]
    fn test_evaluate_leaves_parameters_alone() {
        let model = tiny_model();
        let before: Vec<Tensor> = model.parameters().iter().map(|p| p.value.clone()).collect();
        let batches = cyclic_batches(60, 2);

        let first = evaluate(&model, &batches).unwrap();
        let second = evaluate(&model, &batches).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.num_batches, batches.num_batches());

        let after: Vec<Tensor> = model.parameters().iter().map(|p| p.value.clone()).collect();
        assert_eq!(before, after);
        assert!(matches!(
            evaluate(&model, Vec::<TokenIds>::new()),
            Err(LumiereError::EmptyEpoch)
        ));
    }

    #[test]
    fn test_fit_learns_cyclic_sequence() {
        let mut model = tiny_model();
        let config = TrainingConfig {
            batch_size: 2,
            max_epochs: 6,
            learning_rate: 1e-2,
            weight_decay: 0.0,
            report_every: 5,
            device: Device::Cpu,
            ..TrainingConfig::default()
        };
        let train = cyclic_batches(120, config.batch_size);
        let validation = cyclic_batches(30, config.batch_size);
        let mut optimizer = AdamW::new(config.learning_rate, config.weight_decay);
        let mut scheduler = ConstantLr::new(config.learning_rate);
        let mut reporter = RecordingReporter::default();

        let summaries = fit(
            &mut model,
            &mut optimizer,
            &mut scheduler,
            &train,
            Some(&validation),
            Some(&mut reporter),
            &config,
        )
        .unwrap();

        assert_eq!(summaries.len(), 6);
        for (i, summary) in summaries.iter().enumerate() {
            assert_eq!(summary.epoch, i + 1);
            assert_eq!(summary.train.global_step, (i + 1) * train.num_batches());
            assert!(summary.validation.is_some());
        }
        let first = summaries[0].train.avg_loss;
        let last = summaries[5].train.avg_loss;
        assert!(last < first, "loss did not improve: {} -> {}", first, last);
        assert!(reporter.calls.iter().any(|(_, m)| m.contains_key("val/loss")));
    }

    #[test]
    fn test_training_config_json() {
        let config: TrainingConfig = serde_json::from_str(r#"{"batch_size": 4}"#).unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.report_every, 50);
        assert_eq!(config.device, Device::default());

        let bad = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(bad.validate().is_err());
        let unclipped = TrainingConfig {
            gradient_clip_norm: f32::INFINITY,
            ..TrainingConfig::default()
        };
        assert!(unclipped.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        TrainingConfig::tiny().save_json(&path).unwrap();
        assert_eq!(
            TrainingConfig::from_json_file(&path).unwrap(),
            TrainingConfig::tiny()
        );
    }
}
