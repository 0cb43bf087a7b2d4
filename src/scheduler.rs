//! Learning-Rate Schedulers
//!
//! A scheduler owns a step counter. `step()` advances it by one and
//! `learning_rate()` reports the rate for the current step (the "last lr"
//! after the most recent step). The training loop copies that rate into the
//! optimizer before every update.

/// Step-indexed learning-rate schedule
pub trait LrScheduler {
    /// Advance to the next step
    fn step(&mut self);

    /// Learning rate for the current step
    fn learning_rate(&self) -> f32;

    /// Number of `step()` calls so far
    fn current_step(&self) -> usize;
}

/// Fixed learning rate
#[derive(Clone, Debug)]
pub struct ConstantLr {
    lr: f32,
    current_step: usize,
}

impl ConstantLr {
    pub fn new(lr: f32) -> Self {
        Self { lr, current_step: 0 }
    }
}

impl LrScheduler for ConstantLr {
    fn step(&mut self) {
        self.current_step += 1;
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn current_step(&self) -> usize {
        self.current_step
    }
}

/// Linear warmup followed by cosine decay
///
/// ```text
/// step < warmup:  lr = base_lr * (step + 1) / warmup
/// otherwise:      lr = min_lr + (base_lr - min_lr) * 0.5 * (1 + cos(π * progress))
///                 progress = (step - warmup) / (total - warmup), capped at 1
/// ```
#[derive(Clone, Debug)]
pub struct WarmupCosine {
    base_lr: f32,
    min_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl WarmupCosine {
    pub fn new(base_lr: f32, min_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps: total_steps.max(warmup_steps + 1),
            current_step: 0,
        }
    }

    /// Learning rate at an arbitrary step
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }
        let decay_steps = (self.total_steps - self.warmup_steps) as f64;
        let progress = ((step - self.warmup_steps) as f64 / decay_steps).min(1.0);
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine as f32
    }
}

impl LrScheduler for WarmupCosine {
    fn step(&mut self) {
        self.current_step += 1;
    }

    fn learning_rate(&self) -> f32 {
        self.lr_at(self.current_step)
    }

    fn current_step(&self) -> usize {
        self.current_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let mut s = ConstantLr::new(3e-4);
        s.step();
        s.step();
        assert_eq!(s.learning_rate(), 3e-4);
        assert_eq!(s.current_step(), 2);
    }

    #[test]
    fn test_warmup_then_cosine() {
        let mut s = WarmupCosine::new(1.0, 0.1, 4, 14);
        let mut lrs = vec![s.learning_rate()];
        for _ in 0..20 {
            s.step();
            lrs.push(s.learning_rate());
        }

        assert!((lrs[0] - 0.25).abs() < 1e-6);
        assert!((lrs[3] - 1.0).abs() < 1e-6);
        assert!((lrs[4] - 1.0).abs() < 1e-6);
        assert!((lrs[9] - 0.55).abs() < 1e-5);
        assert!((lrs[14] - 0.1).abs() < 1e-6);
        assert!((lrs[20] - 0.1).abs() < 1e-6);
        for w in lrs[4..].windows(2) {
            assert!(w[1] <= w[0] + 1e-7);
        }
    }

    #[test]
    fn test_no_warmup() {
        let s = WarmupCosine::new(0.5, 0.0, 0, 10);
        assert_eq!(s.learning_rate(), 0.5);
    }
}
