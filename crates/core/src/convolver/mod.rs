//! Convolution engines behind a common interface.
//!
//! Every engine owns the impulse response it loaded and re-partitions it
//! when its fragment size changes. The compositor only ever talks to the
//! [`Convolver`] trait, so the engine is picked at construction time with a
//! [`ConvolverKind`].

mod block;
mod direct;
mod single;
mod two_tier;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use block::SingleBlockConvolver;
pub use direct::DirectConvolver;
pub use single::SingleTierConvolver;
pub use two_tier::{SyncTwoTierConvolver, ThreadedTwoTierConvolver, TwoTierConvolver};

use crate::{ImpulserError, Result, Sample};

/// Fragment size used when nothing else is configured.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;
/// Ratio between the large and the small block of the two-tier engines.
pub const DEFAULT_FACTOR: usize = 16;

/// Rounds a requested fragment size up to the next power of two.
pub fn normalize_fragment_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(ImpulserError::InvalidInput("fragment size must be positive"));
    }
    let rounded = size
        .checked_next_power_of_two()
        .ok_or(ImpulserError::InvalidInput("fragment size is too large"))?;
    if rounded != size {
        warn!(requested = size, used = rounded, "fragment size rounded up to a power of two");
    }
    Ok(rounded)
}

/// Checks that all four channel buffers have the same length and returns it.
pub(crate) fn frame_count(
    in_l: &[Sample],
    in_r: &[Sample],
    out_l: &[Sample],
    out_r: &[Sample],
) -> Result<usize> {
    let n = in_l.len();
    if in_r.len() != n || out_l.len() != n || out_r.len() != n {
        return Err(ImpulserError::InvalidInput(
            "input and output channels must have the same length",
        ));
    }
    Ok(n)
}

/// A stereo convolution engine.
pub trait Convolver: Send {
    /// Loads a stereo impulse response, replacing any previous one.
    ///
    /// An empty response is ignored. On failure the engine is left unloaded,
    /// except when the call is refused because a background worker is
    /// running; then nothing changes.
    fn load(&mut self, left: &[Sample], right: &[Sample]) -> Result<()>;

    /// Drops the impulse response and every buffer derived from it.
    fn unload(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// Convolves one buffer per channel, replacing the output samples.
    ///
    /// Buffers may have any length; the engine re-chunks internally.
    fn process(
        &mut self,
        in_l: &[Sample],
        in_r: &[Sample],
        out_l: &mut [Sample],
        out_r: &mut [Sample],
    ) -> Result<()>;

    /// Clears all signal history. The partitioned response is kept.
    fn mute(&mut self) -> Result<()>;

    /// Changes the fragment size and re-partitions a loaded response.
    ///
    /// `factor` only applies to the two-tier engines.
    fn set_fragment_size(&mut self, fragment_size: usize, factor: usize) -> Result<()>;

    /// Algorithmic delay of the wet signal in samples.
    fn latency(&self) -> usize;

    /// Length of the loaded response, zero when unloaded.
    fn impulse_size(&self) -> usize;

    fn fragment_size(&self) -> usize;

    fn kind(&self) -> ConvolverKind;

    /// Waits for background work and parks it. Engines without a worker
    /// have nothing to do.
    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    /// Makes a background worker wait for late bursts instead of replacing
    /// them with silence. Use it when rendering faster than real time.
    fn set_offline(&mut self, _offline: bool) {}
}

/// Which engine to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvolverKind {
    /// Uniform partition, one fragment of latency.
    SingleTier,
    /// Uniform partition without latency.
    ZeroLatency,
    /// Small head tier plus a large tail tier computed inline.
    #[default]
    TwoTier,
    /// Two tiers with the tail computed on a background thread.
    TwoTierThreaded,
    /// The whole response as one block, latency equal to its length.
    SingleBlock,
    /// Time-domain convolution, for short responses only.
    Direct,
}

impl ConvolverKind {
    pub const ALL: [ConvolverKind; 6] = [
        ConvolverKind::SingleTier,
        ConvolverKind::ZeroLatency,
        ConvolverKind::TwoTier,
        ConvolverKind::TwoTierThreaded,
        ConvolverKind::SingleBlock,
        ConvolverKind::Direct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConvolverKind::SingleTier => "single-tier",
            ConvolverKind::ZeroLatency => "zero-latency",
            ConvolverKind::TwoTier => "two-tier",
            ConvolverKind::TwoTierThreaded => "two-tier-threaded",
            ConvolverKind::SingleBlock => "single-block",
            ConvolverKind::Direct => "direct",
        }
    }

    /// Whether the per-sample cost stays bounded for responses of seconds.
    pub fn suits_long_responses(self) -> bool {
        self != ConvolverKind::Direct
    }

    /// Builds an unloaded engine of this kind.
    pub fn build(self, fragment_size: usize, factor: usize) -> Result<Box<dyn Convolver>> {
        Ok(match self {
            ConvolverKind::SingleTier => Box::new(SingleTierConvolver::new(fragment_size)?),
            ConvolverKind::ZeroLatency => {
                Box::new(SingleTierConvolver::zero_latency(fragment_size)?)
            }
            ConvolverKind::TwoTier => Box::new(SyncTwoTierConvolver::new(fragment_size, factor)?),
            ConvolverKind::TwoTierThreaded => {
                Box::new(ThreadedTwoTierConvolver::new(fragment_size, factor)?)
            }
            ConvolverKind::SingleBlock => Box::new(SingleBlockConvolver::new()),
            ConvolverKind::Direct => Box::new(DirectConvolver::new()),
        })
    }
}

impl fmt::Display for ConvolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConvolverKind {
    type Err = ImpulserError;

    fn from_str(s: &str) -> Result<Self> {
        ConvolverKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ImpulserError::msg(format!("unknown convolver kind '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::test_support::{direct_convolution, noise, TOLERANCE};

    fn run_chunked(
        convolver: &mut dyn Convolver,
        left: &[Sample],
        right: &[Sample],
        chunk: usize,
    ) -> (Vec<Sample>, Vec<Sample>) {
        let mut out_l = vec![0.0; left.len()];
        let mut out_r = vec![0.0; right.len()];
        for ((in_l, in_r), (o_l, o_r)) in left
            .chunks(chunk)
            .zip(right.chunks(chunk))
            .zip(out_l.chunks_mut(chunk).zip(out_r.chunks_mut(chunk)))
        {
            convolver.process(in_l, in_r, o_l, o_r).unwrap();
        }
        (out_l, out_r)
    }

    fn loaded(kind: ConvolverKind, ir_l: &[Sample], ir_r: &[Sample]) -> Box<dyn Convolver> {
        let mut convolver = kind.build(16, 2).unwrap();
        convolver.set_offline(true);
        convolver.load(ir_l, ir_r).unwrap();
        convolver.resume().unwrap();
        convolver
    }

    #[test]
    fn rounds_fragment_sizes_up() {
        assert_eq!(normalize_fragment_size(1000).unwrap(), 1024);
        assert_eq!(normalize_fragment_size(64).unwrap(), 64);
        assert_eq!(normalize_fragment_size(1).unwrap(), 1);
        assert!(normalize_fragment_size(0).is_err());
    }

    #[test]
    fn kinds_parse_and_serialize_in_kebab_case() {
        for kind in ConvolverKind::ALL {
            assert_eq!(kind.as_str().parse::<ConvolverKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("overlap-save".parse::<ConvolverKind>().is_err());
        assert!(!ConvolverKind::Direct.suits_long_responses());
        assert!(ConvolverKind::SingleBlock.suits_long_responses());
    }

    #[test]
    fn impulse_shows_up_after_the_reported_latency() {
        let ir: Vec<Sample> = (0..100).map(|i| 1.0 / (i + 1) as Sample).collect();
        let mut impulse = vec![0.0; 256];
        impulse[0] = 1.0;

        for kind in ConvolverKind::ALL {
            let mut convolver = loaded(kind, &ir, &ir);
            let latency = convolver.latency();
            let (out_l, _) = run_chunked(convolver.as_mut(), &impulse, &impulse, 256);

            let first = out_l.iter().position(|s| s.abs() > 1e-3).unwrap();
            assert_eq!(first, latency, "{kind}");
            for (i, value) in ir.iter().enumerate() {
                assert_abs_diff_eq!(out_l[latency + i], *value, epsilon = TOLERANCE);
            }
        }
    }

    #[test]
    fn every_engine_matches_direct_convolution() {
        let ir_l = noise(150, 1);
        let ir_r = noise(150, 2);
        let in_l = noise(600, 3);
        let in_r = noise(600, 4);
        let expected_l = direct_convolution(&in_l, &ir_l);
        let expected_r = direct_convolution(&in_r, &ir_r);

        for kind in ConvolverKind::ALL {
            let mut convolver = loaded(kind, &ir_l, &ir_r);
            let latency = convolver.latency();
            let (out_l, out_r) = run_chunked(convolver.as_mut(), &in_l, &in_r, 37);

            for i in latency..in_l.len() {
                assert_abs_diff_eq!(out_l[i], expected_l[i - latency], epsilon = TOLERANCE);
                assert_abs_diff_eq!(out_r[i], expected_r[i - latency], epsilon = TOLERANCE);
            }
        }
    }

    #[test]
    fn processing_requires_a_loaded_response() {
        for kind in ConvolverKind::ALL {
            let mut convolver = kind.build(16, 2).unwrap();
            convolver.resume().unwrap();
            let mut out = [0.0; 4];
            let mut out_r = [0.0; 4];
            let err = convolver
                .process(&[0.0; 4], &[0.0; 4], &mut out, &mut out_r)
                .unwrap_err();
            assert!(matches!(err, ImpulserError::NotLoaded), "{kind}");
            assert_eq!(convolver.impulse_size(), 0);
        }
    }

    #[test]
    fn empty_loads_and_empty_buffers_are_ignored() {
        for kind in ConvolverKind::ALL {
            let mut convolver = kind.build(16, 2).unwrap();
            convolver.load(&[], &[]).unwrap();
            assert!(!convolver.is_loaded());

            convolver.load(&[1.0], &[1.0]).unwrap();
            convolver.resume().unwrap();
            convolver.process(&[], &[], &mut [], &mut []).unwrap();
            assert_eq!(convolver.impulse_size(), 1);
        }
    }

    #[test]
    fn failed_load_leaves_every_engine_unloaded() {
        for kind in ConvolverKind::ALL {
            let mut convolver = kind.build(16, 2).unwrap();
            convolver.load(&[1.0, 0.5], &[1.0, 0.5]).unwrap();
            assert!(convolver.is_loaded(), "{kind}");

            let err = convolver.load(&[1.0, 2.0, 3.0], &[1.0]).unwrap_err();
            assert!(matches!(err, ImpulserError::InvalidInput(_)), "{kind}");
            assert!(!convolver.is_loaded(), "{kind}");
            assert_eq!(convolver.impulse_size(), 0, "{kind}");

            convolver.load(&[1.0], &[1.0]).unwrap();
            assert!(convolver.is_loaded(), "{kind}");
        }
    }
}
