//! # microgpt-train — The Training Engine
//!
//! The epoch/iteration loop and everything it coordinates:
//!
//! * **[`Trainer`]** — owns replica + optimizer + schedule. One call to
//!   [`Trainer::train`] runs warmup/cosine scheduling, micro-batch
//!   accumulation, cross-worker reduction, clipping, stepping, periodic
//!   hooks, and logging.
//! * **[`LrSchedule`]** — warmup → cosine → floor, pure per-iteration lookup.
//! * **[`GroupedAdamW`]** / **[`build_optimizer`]** — rank-partitioned
//!   weight-decay groups.
//! * **[`WorkerGroup`]** / **[`Replica`]** — data-parallel topology,
//!   average-reduce collective, final-micro-step gradient sync.
//! * **[`Compute`]** — device + precision capability, resolved once.
//!
//! The engine is generic over the
//! [`SequenceModel`](microgpt_common::SequenceModel) and
//! [`BatchSource`](microgpt_common::BatchSource) collaborators; the
//! binaries instantiate them.

pub mod device;
pub mod dist;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use device::Compute;
pub use dist::{reduce_loss, Replica, SingleProcess, TcpWorkerGroup, WorkerGroup};
pub use optimizer::{build_optimizer, partition_by_rank, GroupedAdamW, ParamPartition};
pub use scheduler::LrSchedule;
pub use trainer::{
    accumulate_grads, clip_grad_norm, sync_on_final, EvalHooks, NoopHooks, Trainer,
};
