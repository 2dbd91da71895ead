//! Large-block bursts of the two-tier convolver.
//!
//! The real-time path fills a [`Burst`] with one large block of input and
//! reads the previous burst's output back while doing so. At each large
//! block boundary it hands the finished burst to a [`BurstPipeline`] and
//! receives the burst that must be played next. A burst handed over at the
//! end of period `k` comes back for playback during period `k + 2`, which
//! gives an asynchronous pipeline a full period to compute it.

mod worker;

pub use worker::BurstWorker;

use crate::{tier::PartitionedTier, Result, StereoBuffer};

/// One large block of input together with the output computed from it.
#[derive(Debug, Default)]
pub struct Burst {
    pub input: StereoBuffer,
    pub output: StereoBuffer,
}

impl Burst {
    pub fn zeroed(len: usize) -> Result<Self> {
        Ok(Self {
            input: StereoBuffer::zeroed(len)?,
            output: StereoBuffer::zeroed(len)?,
        })
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn mute(&mut self) {
        self.input.mute();
        self.output.mute();
    }

    /// Convolves the whole input block through `tier` into `output`.
    pub fn run(&mut self, tier: &mut PartitionedTier) -> Result<()> {
        let Self { input, output } = self;
        tier.process(
            &input.left,
            &input.right,
            &mut output.left,
            &mut output.right,
        )
    }
}

/// Where the large tier of a two-tier convolver gets computed.
pub trait BurstPipeline: Send {
    /// Replaces the large tier (or removes it) and resets every pending
    /// burst to silence. `burst_len` is the large block size.
    fn install(&mut self, tier: Option<PartitionedTier>, burst_len: usize) -> Result<()>;

    /// Hands over the burst finished in this period and returns the one to
    /// play in the next period.
    fn exchange(&mut self, finished: Burst) -> Result<Burst>;

    /// Clears the large tier's history and every pending burst.
    fn mute(&mut self) -> Result<()>;

    /// Waits for outstanding work and parks the pipeline.
    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        false
    }

    /// Waits for late bursts instead of playing silence, for rendering
    /// faster than real time. Inline pipelines are never late.
    fn set_offline(&mut self, _offline: bool) {}

    /// Whether the large tier may be replaced right now.
    fn is_idle(&self) -> bool {
        true
    }

    /// Bursts that were not ready when the real-time path needed them and
    /// were replaced by silence.
    fn overrun_count(&self) -> u64 {
        0
    }
}

/// Computes bursts on the calling thread and holds each result back one
/// period so the timing matches [`BurstWorker`].
#[derive(Debug, Default)]
pub struct InlineBursts {
    tier: Option<PartitionedTier>,
    pending: Burst,
}

impl InlineBursts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BurstPipeline for InlineBursts {
    fn install(&mut self, tier: Option<PartitionedTier>, burst_len: usize) -> Result<()> {
        self.tier = None;
        self.pending = Burst::zeroed(burst_len)?;
        self.tier = tier;
        Ok(())
    }

    fn exchange(&mut self, mut finished: Burst) -> Result<Burst> {
        match self.tier.as_mut() {
            Some(tier) => finished.run(tier)?,
            None => finished.output.mute(),
        }
        std::mem::swap(&mut self.pending, &mut finished);
        Ok(finished)
    }

    fn mute(&mut self) -> Result<()> {
        if let Some(tier) = self.tier.as_mut() {
            tier.mute();
        }
        self.pending.mute();
        Ok(())
    }
}
