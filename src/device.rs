//! Compute Target
//!
//! Selects where tensor arithmetic runs. Every kernel in the crate uses rayon,
//! so the target is the rayon pool the training run is installed into:
//!
//! - `Cpu`: a single worker, fully sequential
//! - `Parallel { threads }`: a pool of `threads` workers (`None` = one per core)
//!
//! Results do not depend on the target except for float summation order.

use serde::{Deserialize, Serialize};

use crate::error::{LumiereError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Parallel {
        #[serde(default)]
        threads: Option<usize>,
    },
}

impl Default for Device {
    fn default() -> Self {
        Device::Parallel { threads: None }
    }
}

impl Device {
    /// Worker count, or `None` to let rayon pick
    pub fn num_threads(&self) -> Option<usize> {
        match *self {
            Device::Cpu => Some(1),
            Device::Parallel { threads } => threads,
        }
    }

    /// Build the rayon pool for this target
    ///
    /// Run work inside it with `pool.install(|| ...)`.
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|idx| format!("lumiere-worker-{idx}"));
        if let Some(threads) = self.num_threads() {
            if threads == 0 {
                return Err(LumiereError::InvalidArgument(
                    "thread count must be positive".to_string(),
                ));
            }
            builder = builder.num_threads(threads);
        }
        builder
            .build()
            .map_err(|e| LumiereError::InvalidArgument(format!("thread pool: {}", e)))
    }
}
