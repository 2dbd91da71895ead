use tracing::debug;

use super::{frame_count, normalize_fragment_size, Convolver, ConvolverKind};
use crate::{
    tier::PartitionedTier, ImpulseResponse, ImpulserError, Result, Sample, StereoBuffer,
};

/// Uniformly partitioned convolver.
///
/// The buffered flavour collects whole fragments before handing them to the
/// tier, which costs one fragment of latency but makes the output
/// independent of how the host splits its buffers. The zero-latency flavour
/// feeds the tier directly and re-transforms the partial block on every
/// call instead.
#[derive(Debug)]
pub struct SingleTierConvolver {
    fragment_size: usize,
    zero_latency: bool,
    impulse: Option<ImpulseResponse>,
    tier: Option<PartitionedTier>,
    /// Input collected for the next block (buffered flavour only).
    pending: StereoBuffer,
    /// Output of the previous block, played while `pending` fills.
    ready: StereoBuffer,
    position: usize,
}

impl SingleTierConvolver {
    /// Buffered engine with a latency of one fragment.
    pub fn new(fragment_size: usize) -> Result<Self> {
        Self::with_mode(fragment_size, false)
    }

    /// Engine whose output starts in the same call as its input.
    pub fn zero_latency(fragment_size: usize) -> Result<Self> {
        Self::with_mode(fragment_size, true)
    }

    fn with_mode(fragment_size: usize, zero_latency: bool) -> Result<Self> {
        Ok(Self {
            fragment_size: normalize_fragment_size(fragment_size)?,
            zero_latency,
            impulse: None,
            tier: None,
            pending: StereoBuffer::default(),
            ready: StereoBuffer::default(),
            position: 0,
        })
    }

    pub fn fragment_count(&self) -> usize {
        self.tier.as_ref().map_or(0, PartitionedTier::fragment_count)
    }

    fn release(&mut self) {
        self.tier = None;
        self.pending.release();
        self.ready.release();
        self.position = 0;
        self.impulse = None;
    }

    fn rebuild(&mut self, impulse: ImpulseResponse) -> Result<()> {
        self.release();

        let tier = PartitionedTier::new(impulse.left(), impulse.right(), self.fragment_size)?;
        if !self.zero_latency {
            self.pending = StereoBuffer::zeroed(self.fragment_size)?;
            self.ready = StereoBuffer::zeroed(self.fragment_size)?;
        }
        debug!(
            kind = %self.kind(),
            impulse = impulse.len(),
            fragment = self.fragment_size,
            fragments = tier.fragment_count(),
            "loaded impulse response"
        );
        self.tier = Some(tier);
        self.impulse = Some(impulse);
        Ok(())
    }
}

impl Convolver for SingleTierConvolver {
    fn load(&mut self, left: &[Sample], right: &[Sample]) -> Result<()> {
        if left.is_empty() && right.is_empty() {
            return Ok(());
        }
        let result = ImpulseResponse::new(left, right).and_then(|impulse| self.rebuild(impulse));
        if result.is_err() {
            self.release();
        }
        result
    }

    fn unload(&mut self) -> Result<()> {
        if self.tier.is_some() {
            debug!(kind = %self.kind(), "unloaded impulse response");
        }
        self.release();
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.tier.is_some()
    }

    fn process(
        &mut self,
        in_l: &[Sample],
        in_r: &[Sample],
        out_l: &mut [Sample],
        out_r: &mut [Sample],
    ) -> Result<()> {
        let n = frame_count(in_l, in_r, out_l, out_r)?;
        if n == 0 {
            return Ok(());
        }
        let Self {
            fragment_size,
            zero_latency,
            tier,
            pending,
            ready,
            position,
            ..
        } = self;
        let tier = tier.as_mut().ok_or(ImpulserError::NotLoaded)?;

        let mut offset = 0;
        while offset < n {
            if *zero_latency {
                let len = tier.remaining().min(n - offset);
                let range = offset..offset + len;
                tier.process(
                    &in_l[range.clone()],
                    &in_r[range.clone()],
                    &mut out_l[range.clone()],
                    &mut out_r[range],
                )?;
                offset += len;
                continue;
            }

            let len = (*fragment_size - *position).min(n - offset);
            let range = offset..offset + len;
            let slot = *position..*position + len;
            pending.left[slot.clone()].copy_from_slice(&in_l[range.clone()]);
            pending.right[slot.clone()].copy_from_slice(&in_r[range.clone()]);
            out_l[range.clone()].copy_from_slice(&ready.left[slot.clone()]);
            out_r[range].copy_from_slice(&ready.right[slot]);

            *position += len;
            if *position == *fragment_size {
                tier.process(
                    &pending.left,
                    &pending.right,
                    &mut ready.left,
                    &mut ready.right,
                )?;
                *position = 0;
            }
            offset += len;
        }
        Ok(())
    }

    fn mute(&mut self) -> Result<()> {
        if let Some(tier) = self.tier.as_mut() {
            tier.mute();
        }
        self.pending.mute();
        self.ready.mute();
        self.position = 0;
        Ok(())
    }

    fn set_fragment_size(&mut self, fragment_size: usize, _factor: usize) -> Result<()> {
        let fragment_size = normalize_fragment_size(fragment_size)?;
        if fragment_size == self.fragment_size {
            return Ok(());
        }
        self.fragment_size = fragment_size;
        match self.impulse.take() {
            Some(impulse) => {
                let result = self.rebuild(impulse);
                if result.is_err() {
                    self.release();
                }
                result
            }
            None => Ok(()),
        }
    }

    fn latency(&self) -> usize {
        if self.zero_latency {
            0
        } else {
            self.fragment_size
        }
    }

    fn impulse_size(&self) -> usize {
        self.impulse.as_ref().map_or(0, ImpulseResponse::len)
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn kind(&self) -> ConvolverKind {
        if self.zero_latency {
            ConvolverKind::ZeroLatency
        } else {
            ConvolverKind::SingleTier
        }
    }
}
