//! Codec and sample-rate conversion layer
//!
//! Everything above this module works on linear 16-bit PCM; this layer is
//! the only place companded/adaptive wire formats and sample rates are
//! handled.

pub mod codec;
pub mod resample;

pub use codec::{decode, encode, transcode, Codec, CodecError};
pub use resample::{resample, ResampleError};
