//! Parameter partitioning and the grouped AdamW factory.
//!
//! Matrix and embedding weights (rank >= 2) get weight decay; biases and
//! norm scale/shift parameters (rank < 2) do not. Each group is driven by
//! its own AdamW instance; [`GroupedAdamW`] fans learning-rate updates and
//! steps out to both.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::device::Compute;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.95;
const EPS: f64 = 1e-8;

/// Named parameters split by tensor rank, each sorted by name.
pub struct ParamPartition {
    pub decay: Vec<(String, Var)>,
    pub no_decay: Vec<(String, Var)>,
}

impl ParamPartition {
    fn elems(group: &[(String, Var)]) -> usize {
        group.iter().map(|(_, v)| v.as_tensor().elem_count()).sum()
    }
}

/// Partition every trainable parameter in the map by tensor rank.
///
/// Candle `Var`s always track gradients, so the map's contents are exactly
/// the trainable set. Sorted by name so group order (and the order
/// gradients cross the wire) is identical on every worker.
pub fn partition_by_rank(varmap: &VarMap) -> ParamPartition {
    let mut named: Vec<(String, Var)> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));

    let mut decay = Vec::new();
    let mut no_decay = Vec::new();
    for (name, var) in named {
        if var.as_tensor().dims().len() >= 2 {
            decay.push((name, var));
        } else {
            no_decay.push((name, var));
        }
    }
    ParamPartition { decay, no_decay }
}

/// AdamW over the two weight-decay groups.
///
/// Both groups share betas (0.9, 0.95), eps 1e-8, and the base learning
/// rate; only the decay group carries the configured weight decay. Empty
/// groups are valid and make the step a no-op.
pub struct GroupedAdamW {
    decay: AdamW,
    no_decay: AdamW,
}

impl GroupedAdamW {
    /// Write one schedule value into every group.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    /// Apply one update to both groups from the accumulated gradients.
    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.decay.step(grads)?;
        self.no_decay.step(grads)
    }
}

/// Partition the map and build the grouped optimizer.
///
/// The kernel path the update runs on follows the resolved compute device
/// (fused device kernels on GPU-class hardware); the choice is
/// performance-only and is reported, never semantic. Reporting happens on
/// the main worker only.
pub fn build_optimizer(
    varmap: &VarMap,
    weight_decay: f64,
    learning_rate: f64,
    compute: &Compute,
    is_main: bool,
) -> Result<GroupedAdamW> {
    let partition = partition_by_rank(varmap);

    if is_main {
        tracing::info!(
            decay_tensors = partition.decay.len(),
            decay_params = ParamPartition::elems(&partition.decay),
            no_decay_tensors = partition.no_decay.len(),
            no_decay_params = ParamPartition::elems(&partition.no_decay),
            execution_path = compute.execution_path(),
            "optimizer parameter groups"
        );
    }

    let decay = AdamW::new(
        partition.decay.iter().map(|(_, v)| v.clone()).collect(),
        ParamsAdamW {
            lr: learning_rate,
            beta1: BETA1,
            beta2: BETA2,
            eps: EPS,
            weight_decay,
        },
    )?;
    let no_decay = AdamW::new(
        partition.no_decay.iter().map(|(_, v)| v.clone()).collect(),
        ParamsAdamW {
            lr: learning_rate,
            beta1: BETA1,
            beta2: BETA2,
            eps: EPS,
            weight_decay: 0.0,
        },
    )?;

    Ok(GroupedAdamW { decay, no_decay })
}

// ── Tests ───────────────────────────────────────────────────────────────────
