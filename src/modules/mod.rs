//! Neural network building blocks shared by the acoustic models.
//!
//! Recurrent cells, the decoder prenet, attention policies, global style
//! tokens and the invertible flow layers used by the flow decoder.

pub mod attention;
pub mod conv;
pub mod flow;
pub mod gst;
pub mod prenet;
pub mod rnn;
