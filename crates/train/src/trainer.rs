//! The training orchestrator.
//!
//! Owns the epoch/iteration loop and the per-iteration sequence:
//! accumulate micro-batches → sync/reduce across workers → clip → schedule
//! → optimizer step → periodic hooks → log. Parameters move exactly once
//! per iteration, in the optimizer step, from the single thread driving
//! this worker's loop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{loss, VarMap};

use microgpt_common::{batch_to_tensors, BatchSource, SequenceModel, TrainConfig};

use crate::device::Compute;
use crate::dist::{reduce_loss, Replica, WorkerGroup};
use crate::optimizer::build_optimizer;
use crate::scheduler::LrSchedule;

// ── Hooks ───────────────────────────────────────────────────────────────────

/// Periodic validation/evaluation hooks.
///
/// Invoked every `eval_every` iterations and on the last iteration of each
/// epoch. The default bodies do nothing; collaborators override without the
/// orchestrator changing.
pub trait EvalHooks {
    fn validate(&mut self) -> Result<()> {
        Ok(())
    }
    fn evaluate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The do-nothing default hooks.
pub struct NoopHooks;

impl EvalHooks for NoopHooks {}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// True exactly on the final micro-step of an iteration: the only
/// micro-step whose backward pass may trigger cross-worker gradient
/// traffic.
pub fn sync_on_final(micro_step: usize, grad_accum_iters: usize) -> bool {
    micro_step + 1 == grad_accum_iters
}

/// Sum a micro-step's gradients into the iteration accumulator, per
/// parameter. Usable standalone for custom loops.
pub fn accumulate_grads(
    acc: &mut GradStore,
    step: &GradStore,
    vars: &[(String, Var)],
) -> Result<()> {
    for (_, var) in vars {
        if let Some(grad) = step.get(var.as_tensor()) {
            let merged = match acc.remove(var.as_tensor()) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), merged);
        }
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`; returns
/// the pre-clip norm. `max_norm <= 0` disables clipping but still reports
/// the norm.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    vars: &[(String, Var)],
    max_norm: f64,
) -> Result<f64> {
    let mut total = 0.0f64;
    for (_, var) in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / norm.max(1e-12);
        for (_, var) in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the replica-wrapped model, the batch source,
/// and the schedule; mutates model parameters only through the optimizer
/// step.
pub struct Trainer<M, L> {
    replica: Replica<M>,
    varmap: VarMap,
    /// Name-sorted snapshot of the trainable set; fixed for the run.
    vars: Vec<(String, Var)>,
    source: L,
    schedule: LrSchedule,
    compute: Compute,
    group: Arc<dyn WorkerGroup>,
    hooks: Box<dyn EvalHooks>,
    config: TrainConfig,
    /// Present on the main worker only.
    log_path: Option<PathBuf>,
}

impl<M: SequenceModel, L: BatchSource> Trainer<M, L> {
    /// Validates the config and truncates `<log_dir>/log.txt` (main worker
    /// only) so each run starts a fresh log.
    pub fn new(
        model: M,
        varmap: VarMap,
        source: L,
        config: TrainConfig,
        compute: Compute,
        group: Arc<dyn WorkerGroup>,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = LrSchedule::from_config(&config);

        let mut vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let log_path = if group.is_main() {
            std::fs::create_dir_all(&config.log_dir).context("create log dir")?;
            let path = config.log_dir.join("log.txt");
            File::create(&path).context("truncate log file")?;
            Some(path)
        } else {
            None
        };

        Ok(Self {
            replica: Replica::new(model, Arc::clone(&group)),
            varmap,
            vars,
            source,
            schedule,
            compute,
            group,
            hooks: Box::new(NoopHooks),
            config,
            log_path,
        })
    }

    /// Install validation/evaluation hooks.
    pub fn with_hooks(mut self, hooks: Box<dyn EvalHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn model(&self) -> &M {
        self.replica.model()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Run the full training loop: `n_epochs` epochs of exactly `max_iters`
    /// iterations each.
    pub fn train(&mut self) -> Result<()> {
        let mut optimizer = build_optimizer(
            &self.varmap,
            self.config.weight_decay,
            self.config.max_lr,
            &self.compute,
            self.group.is_main(),
        )?;

        for epoch in 0..self.config.n_epochs {
            self.source.reset();

            for iter in 0..self.config.max_iters {
                let t0 = Instant::now();

                // Fresh accumulators: gradients build up across micro-steps
                // and must only be cleared here, once per iteration.
                let (first_loss, mut grads) = self.micro_step(0)?;
                let mut accumulated_loss = first_loss;
                for micro_step in 1..self.config.grad_accum_iters {
                    let (loss_val, step_grads) = self.micro_step(micro_step)?;
                    accumulated_loss += loss_val;
                    accumulate_grads(&mut grads, &step_grads, &self.vars)?;
                }

                // Cross-worker coordination: gradients once (final
                // micro-step flag), then the scalar loss.
                self.replica.sync_grads(&mut grads, &self.vars)?;
                let train_loss = reduce_loss(self.group.as_ref(), accumulated_loss)?;

                let norm = clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip)?;

                let lr = self.schedule.lr(iter);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                let last_iter = iter + 1 == self.config.max_iters;
                if iter % self.config.eval_every == 0 || last_iter {
                    self.hooks.validate()?;
                    self.hooks.evaluate()?;
                }

                // Queued device work must drain before the clock is read.
                self.compute.synchronize()?;
                let dt = t0.elapsed().as_secs_f64();
                let tokens_processed = self.source.batch_size()
                    * self.source.seq_len()
                    * self.config.grad_accum_iters
                    * self.group.world_size();
                let tokens_per_sec = tokens_processed as f64 / dt;

                if self.group.is_main() {
                    if self.config.monitor {
                        tracing::info!(
                            epoch,
                            iter,
                            loss = format!("{train_loss:.6}"),
                            lr = format!("{lr:.4e}"),
                            norm = format!("{norm:.4}"),
                            dt_ms = format!("{:.2}", dt * 1e3),
                            tok_per_sec = format!("{tokens_per_sec:.2}"),
                            "train step"
                        );
                    }
                    if let Some(path) = &self.log_path {
                        let mut f = OpenOptions::new()
                            .append(true)
                            .open(path)
                            .context("open log file for append")?;
                        writeln!(f, "epoch {epoch} | iter {iter} | train loss: {train_loss:.6}")?;
                    }
                }
            }
        }
        Ok(())
    }

    /// One micro-batch: draw, transfer, forward, scale, backward.
    ///
    /// Returns the scaled loss value and the micro-step's gradients. The
    /// loss is divided by `grad_accum_iters` before backward so the
    /// accumulated gradient is that of the mean loss over the effective
    /// batch, not a sum.
    fn micro_step(&mut self, micro_step: usize) -> Result<(f32, GradStore)> {
        self.replica
            .set_grad_sync(sync_on_final(micro_step, self.config.grad_accum_iters));

        let (inputs, targets) = self.source.next_batch()?;
        let (inputs, targets) = batch_to_tensors(
            &inputs,
            &targets,
            self.source.batch_size(),
            self.source.seq_len(),
            self.compute.device(),
        )?;

        let logits = self.replica.forward(&inputs, &targets)?;
        let (b, t, v) = logits.dims3()?;
        let logits = logits.reshape((b * t, v))?.to_dtype(DType::F32)?;
        let targets = targets.reshape((b * t,))?;
        let loss = loss::cross_entropy(&logits, &targets)?;

        let scaled = loss.affine(1.0 / self.config.grad_accum_iters as f64, 0.0)?;
        let loss_val = scaled.to_scalar::<f32>()?;
        let grads = scaled.backward()?;
        Ok((loss_val, grads))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
