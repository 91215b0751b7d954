//! Training orchestration: the step loop and the components it drives.
//!
//! [`session::run`] wires configuration, data and a model family into a
//! [`Trainer`]. Everything below it is usable on its own, which is how the
//! integration tests exercise checkpointing and distributed reduction.

pub mod checkpoint;
pub mod clip;
pub mod ddi;
pub mod distributed;
pub mod experiment;
pub mod logger;
pub mod scaler;
pub mod scheduler;
pub mod session;
pub mod synthesis;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointTag, LoadOutcome, TrainingState};
pub use ddi::{DataDependentInitializer, DdiOutcome};
pub use distributed::{Collective, DistributedCoordinator, LocalCollective, TcpCollective};
pub use scaler::GradientScaler;
pub use scheduler::NoamScheduler;
pub use session::{adam_config, run, RunOptions};
pub use synthesis::{SynthesisOutcome, TestSentenceSynthesizer};
pub use trainer::{Diagnostics, StepReport, TrainData, Trainer};
