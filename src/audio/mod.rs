//! Audio collaborators: WAV I/O and mel analysis with Griffin-Lim inversion.
//!
//! The trainer only needs three things from audio: a mel spectrogram for
//! feature extraction, an approximate inverse for listening to predictions,
//! and a way to write the result to disk.

pub mod io;
pub mod processor;

pub use io::WavIo;
pub use processor::{AudioProcessor, MelProcessor};
