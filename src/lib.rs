//! # cadence - neural text-to-speech training
//!
//! Trains acoustic models that map character sequences to mel spectrograms.
//! Two families are supported behind one [`model::AcousticModel`] trait:
//!
//! 1. **Tacotron** ([`model::Tacotron`]): an attention-based autoregressive
//!    decoder with a configurable attention strategy, optional backward
//!    decoder, style tokens and a postnet.
//!
//! 2. **Glow-TTS** ([`model::GlowTts`]): a normalizing-flow decoder aligned to
//!    the text with monotonic alignment search, calibrated from data before
//!    the first step.
//!
//! The [`train`] module holds the loop itself together with checkpoints,
//! gradient scaling and clipping, and data-parallel coordination.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn_autodiff::Autodiff;
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use cadence::config::load_config;
//! use cadence::train::{run, DistributedCoordinator, RunOptions};
//! use std::sync::atomic::AtomicBool;
//!
//! let config = load_config("config.yaml").unwrap();
//! let options = RunOptions {
//!     config,
//!     out_path: Some("runs/demo".into()),
//!     restore_path: None,
//!     best_loss: f32::INFINITY,
//! };
//! run::<Autodiff<NdArray<f32>>>(
//!     &options,
//!     DistributedCoordinator::single(),
//!     NdArrayDevice::default(),
//!     &AtomicBool::new(false),
//! )
//! .unwrap();
//! ```

pub mod audio;
pub mod config;
pub mod data;
pub mod error;
pub mod loss;
pub mod measures;
pub mod perf;
pub mod text;
pub mod train;
pub mod visual;

// Internal modules - exposed for integration tests but not part of stable API.
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;

pub use config::{load_config, TrainConfig};
pub use error::{TrainError, TrainResult};
