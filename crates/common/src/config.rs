//! Run configuration for a training run.
//!
//! Serialised as JSON so a run can be reproduced from a single file. Every
//! field has a default, so a minimal `{}` produces a valid (if long) run.
//! The config is resolved once at startup and passed into the trainer by
//! value; nothing reads it from ambient state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hyper-parameters of the training loop.
///
/// `warmup_iters`/`max_iters` bound the learning-rate schedule and the
/// per-epoch iteration count; `grad_accum_iters` is the number of
/// micro-batches summed into one optimizer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of epochs. Each epoch rewinds the batch source and runs
    /// exactly `max_iters` iterations.
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    /// Iterations of linear learning-rate warmup.
    #[serde(default = "default_warmup_iters")]
    pub warmup_iters: usize,
    /// Iterations per epoch; also the end of the cosine decay horizon.
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Micro-batches accumulated into one optimizer step.
    #[serde(default = "default_grad_accum_iters")]
    pub grad_accum_iters: usize,
    /// Peak learning rate, reached at the end of warmup.
    #[serde(default = "default_max_lr")]
    pub max_lr: f64,
    /// Learning-rate floor after the decay horizon.
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    /// Weight decay for the decay parameter group (rank >= 2 tensors).
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Global gradient-norm clip. 0 disables clipping.
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    /// Invoke the validation/evaluation hooks every this many iterations
    /// (and always on the last iteration of an epoch).
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    /// Emit the per-iteration status line on the main worker.
    #[serde(default = "default_true")]
    pub monitor: bool,
    /// Directory for the append-only `log.txt`, truncated at run start.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_n_epochs() -> usize {
    1
}
fn default_warmup_iters() -> usize {
    715
}
fn default_max_iters() -> usize {
    19_073
}
fn default_grad_accum_iters() -> usize {
    1
}
fn default_max_lr() -> f64 {
    6e-4
}
// The floor defaults to peak / 10. An earlier revision of this loop shipped
// with min/max swapped (floor 6e-3 over a 6e-4 peak); `validate` now rejects
// that ordering outright.
fn default_min_lr() -> f64 {
    6e-5
}
fn default_weight_decay() -> f64 {
    0.1
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_eval_every() -> usize {
    500
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs: default_n_epochs(),
            warmup_iters: default_warmup_iters(),
            max_iters: default_max_iters(),
            grad_accum_iters: default_grad_accum_iters(),
            max_lr: default_max_lr(),
            min_lr: default_min_lr(),
            weight_decay: default_weight_decay(),
            grad_clip: default_grad_clip(),
            eval_every: default_eval_every(),
            monitor: default_true(),
            log_dir: default_log_dir(),
        }
    }
}

impl TrainConfig {
    /// Reject configurations the schedule or the loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_iters == 0 {
            anyhow::bail!("max_iters must be at least 1");
        }
        if self.grad_accum_iters == 0 {
            anyhow::bail!("grad_accum_iters must be at least 1");
        }
        if self.warmup_iters >= self.max_iters {
            anyhow::bail!(
                "warmup_iters ({}) must be below max_iters ({})",
                self.warmup_iters,
                self.max_iters
            );
        }
        if self.max_lr <= 0.0 {
            anyhow::bail!("max_lr must be positive, got {}", self.max_lr);
        }
        if self.min_lr > self.max_lr {
            anyhow::bail!(
                "min_lr ({}) exceeds max_lr ({}); the floor must sit below the peak",
                self.min_lr,
                self.max_lr
            );
        }
        if self.eval_every == 0 {
            anyhow::bail!("eval_every must be at least 1");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
