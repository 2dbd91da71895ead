//! Core library for the Impulser convolution engine.
//!
//! The crate convolves stereo audio with long impulse responses using
//! uniformly and non-uniformly partitioned FFT convolution, with a
//! single-block and a time-domain engine for short responses. Each module owns
//! a distinct layer (spectra, fragments, tiers, engines, mixing) so that the
//! engines can be composed and tested in isolation.

pub mod buffer;
pub mod burst;
pub mod compositor;
pub mod config;
pub mod convolver;
pub mod delay;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod spectrum;
pub mod tier;

/// Sample type used for audio, spectra and gains.
#[cfg(not(feature = "single-precision"))]
pub type Sample = f64;

/// Sample type used for audio, spectra and gains.
#[cfg(feature = "single-precision")]
pub type Sample = f32;

pub use buffer::{ImpulseResponse, StereoBuffer};
pub use burst::{Burst, BurstPipeline, BurstWorker, InlineBursts};
pub use compositor::{Compositor, ProcessOptions};
pub use config::EngineConfig;
pub use convolver::{
    Convolver, ConvolverKind, DirectConvolver, SingleBlockConvolver, SingleTierConvolver,
    SyncTwoTierConvolver, ThreadedTwoTierConvolver, TwoTierConvolver,
};
pub use delay::DelayLine;
pub use error::{ImpulserError, Result};
pub use filter::PostFilter;
pub use fragment::Fragment;
pub use spectrum::SpectrumTransform;
pub use tier::PartitionedTier;
