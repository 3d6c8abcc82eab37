//! # microgpt-core — Reference Model
//!
//! A small GPT-style decoder used by the binaries and the integration
//! tests. The training engine's library modules only see the
//! [`SequenceModel`](microgpt_common::SequenceModel) contract; this crate
//! provides the model the `train` binary instantiates.
//!
//! * **[`GptConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`MicroGpt`]** — token + position embeddings, pre-norm causal
//!   attention blocks, weight-tied LM head.

pub mod config;
pub mod model;

pub use config::GptConfig;
pub use model::MicroGpt;
