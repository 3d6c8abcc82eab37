//! # microgpt-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainConfig`]** — run hyper-parameters (serialised as JSON).
//! * **[`BatchSource`]** / **[`BatchCursor`]** / **[`TokenStore`]** — data
//!   loading and cycling batch iteration.
//! * **[`SequenceModel`]** — the model contract the trainer is generic over.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

pub mod config;
pub mod data;
pub mod model;

pub use config::TrainConfig;
pub use data::{batch_to_tensors, write_tokenized_file, BatchCursor, BatchSource, TokenStore};
pub use model::SequenceModel;
