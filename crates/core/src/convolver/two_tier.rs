use std::fmt;

use tracing::{debug, warn};

use super::{frame_count, normalize_fragment_size, Convolver, ConvolverKind};
use crate::{
    burst::{Burst, BurstPipeline, BurstWorker, InlineBursts},
    tier::PartitionedTier,
    ImpulseResponse, ImpulserError, Result, Sample,
};

/// Two-tier partitioned convolver.
///
/// The head of the response, `[0, 2 * large)`, is convolved by a small tier
/// on every call. The tail is cut into large fragments (`small * factor`
/// samples) and convolved once per large block by a [`BurstPipeline`]. A
/// burst collected during large period `k` is played during period `k + 2`,
/// which is exactly where the tail starts, so the engine adds no latency.
pub struct TwoTierConvolver<P: BurstPipeline> {
    small_size: usize,
    factor: usize,
    kind: ConvolverKind,
    impulse: Option<ImpulseResponse>,
    small: Option<PartitionedTier>,
    pipeline: P,
    /// Burst being filled with input while its output is played.
    current: Burst,
    cursor: usize,
    has_tail: bool,
    large_fragments: usize,
}

/// Two-tier engine that computes the tail on the calling thread.
pub type SyncTwoTierConvolver = TwoTierConvolver<InlineBursts>;

/// Two-tier engine that computes the tail on a [`BurstWorker`].
///
/// The worker starts suspended: load the response, then
/// [`resume`](Convolver::resume) before processing. Loading, unloading and
/// resizing require the worker to be suspended again. A burst the worker
/// does not finish in time is played as silence unless
/// [`set_offline`](Convolver::set_offline) is on.
pub type ThreadedTwoTierConvolver = TwoTierConvolver<BurstWorker>;

impl SyncTwoTierConvolver {
    pub fn new(small_size: usize, factor: usize) -> Result<Self> {
        Self::with_pipeline(
            InlineBursts::new(),
            ConvolverKind::TwoTier,
            small_size,
            factor,
        )
    }
}

impl ThreadedTwoTierConvolver {
    pub fn new(small_size: usize, factor: usize) -> Result<Self> {
        Self::with_pipeline(
            BurstWorker::spawn()?,
            ConvolverKind::TwoTierThreaded,
            small_size,
            factor,
        )
    }
}

impl<P: BurstPipeline> TwoTierConvolver<P> {
    fn with_pipeline(
        pipeline: P,
        kind: ConvolverKind,
        small_size: usize,
        factor: usize,
    ) -> Result<Self> {
        if factor == 0 {
            return Err(ImpulserError::InvalidInput("factor must be positive"));
        }
        Ok(Self {
            small_size: normalize_fragment_size(small_size)?,
            factor,
            kind,
            impulse: None,
            small: None,
            pipeline,
            current: Burst::default(),
            cursor: 0,
            has_tail: false,
            large_fragments: 0,
        })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn small_fragment_size(&self) -> usize {
        self.small_size
    }

    pub fn large_fragment_size(&self) -> usize {
        self.small_size * self.factor
    }

    pub fn small_fragment_count(&self) -> usize {
        self.small.as_ref().map_or(0, PartitionedTier::fragment_count)
    }

    pub fn large_fragment_count(&self) -> usize {
        self.large_fragments
    }

    /// Bursts that were not ready in time and played as silence.
    pub fn overrun_count(&self) -> u64 {
        self.pipeline.overrun_count()
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.pipeline.is_idle() {
            Ok(())
        } else {
            Err(ImpulserError::Precondition(
                "suspend the convolver before changing its impulse response",
            ))
        }
    }

    fn release(&mut self) -> Result<()> {
        self.small = None;
        self.current = Burst::default();
        self.cursor = 0;
        self.has_tail = false;
        self.large_fragments = 0;
        self.impulse = None;
        self.pipeline.install(None, 0)
    }

    fn rebuild(&mut self, impulse: ImpulseResponse) -> Result<()> {
        self.release()?;

        let large_size = self.large_fragment_size();
        let head = impulse.len().min(2 * large_size);
        let (left, right) = (impulse.left(), impulse.right());

        let small = PartitionedTier::new(&left[..head], &right[..head], self.small_size)?;
        let tail = if impulse.len() > head {
            Some(PartitionedTier::new(&left[head..], &right[head..], large_size)?)
        } else {
            None
        };

        let large_fragments = tail.as_ref().map_or(0, PartitionedTier::fragment_count);
        let burst_len = if tail.is_some() { large_size } else { 0 };
        let current = Burst::zeroed(burst_len)?;
        self.pipeline.install(tail, burst_len)?;

        self.small = Some(small);
        self.current = current;
        self.has_tail = burst_len > 0;
        self.large_fragments = large_fragments;
        self.impulse = Some(impulse);
        debug!(config = %self, "loaded impulse response");
        Ok(())
    }

    /// Builds from `impulse`, leaving the engine unloaded when anything fails.
    fn rebuild_or_release(&mut self, impulse: Result<ImpulseResponse>) -> Result<()> {
        let result = impulse.and_then(|impulse| self.rebuild(impulse));
        if result.is_err() {
            if let Err(err) = self.release() {
                warn!(%err, kind = %self.kind, "failed to release a partially loaded response");
            }
        }
        result
    }
}

impl<P: BurstPipeline> Convolver for TwoTierConvolver<P> {
    fn load(&mut self, left: &[Sample], right: &[Sample]) -> Result<()> {
        if left.is_empty() && right.is_empty() {
            return Ok(());
        }
        self.ensure_idle()?;
        self.rebuild_or_release(ImpulseResponse::new(left, right))
    }

    fn unload(&mut self) -> Result<()> {
        self.ensure_idle()?;
        if self.small.is_some() {
            debug!(kind = %self.kind, "unloaded impulse response");
        }
        self.release()
    }

    fn is_loaded(&self) -> bool {
        self.small.is_some()
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
        if self.pipeline.is_suspended() {
            return Err(ImpulserError::Suspended);
        }
        let small = self.small.as_mut().ok_or(ImpulserError::NotLoaded)?;

        let mut offset = 0;
        while offset < n {
            let len = small.remaining().min(n - offset);
            let range = offset..offset + len;
            small.process(
                &in_l[range.clone()],
                &in_r[range.clone()],
                &mut out_l[range.clone()],
                &mut out_r[range.clone()],
            )?;
            offset += len;

            if !self.has_tail {
                continue;
            }

            let slot = self.cursor..self.cursor + len;
            let burst = &mut self.current;
            for (out, tail) in out_l[range.clone()].iter_mut().zip(&burst.output.left[slot.clone()]) {
                *out += *tail;
            }
            for (out, tail) in out_r[range.clone()].iter_mut().zip(&burst.output.right[slot.clone()]) {
                *out += *tail;
            }
            burst.input.left[slot.clone()].copy_from_slice(&in_l[range.clone()]);
            burst.input.right[slot].copy_from_slice(&in_r[range]);

            self.cursor += len;
            if self.cursor == self.current.len() {
                let finished = std::mem::take(&mut self.current);
                self.cursor = 0;
                match self.pipeline.exchange(finished) {
                    Ok(next) => self.current = next,
                    Err(err) => {
                        // The burst is lost; only a reload brings the tail back.
                        self.has_tail = false;
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn mute(&mut self) -> Result<()> {
        if let Some(small) = self.small.as_mut() {
            small.mute();
        }
        self.current.mute();
        self.cursor = 0;
        self.pipeline.mute()
    }

    fn set_fragment_size(&mut self, fragment_size: usize, factor: usize) -> Result<()> {
        if factor == 0 {
            return Err(ImpulserError::InvalidInput("factor must be positive"));
        }
        let small_size = normalize_fragment_size(fragment_size)?;
        if small_size == self.small_size && factor == self.factor {
            return Ok(());
        }
        self.ensure_idle()?;
        self.small_size = small_size;
        self.factor = factor;
        match self.impulse.take() {
            Some(impulse) => self.rebuild_or_release(Ok(impulse)),
            None => Ok(()),
        }
    }

    fn latency(&self) -> usize {
        0
    }

    fn impulse_size(&self) -> usize {
        self.impulse.as_ref().map_or(0, ImpulseResponse::len)
    }

    fn fragment_size(&self) -> usize {
        self.small_size
    }

    fn kind(&self) -> ConvolverKind {
        self.kind
    }

    fn suspend(&mut self) -> Result<()> {
        self.pipeline.suspend()
    }

    fn resume(&mut self) -> Result<()> {
        self.pipeline.resume()
    }

    fn set_offline(&mut self, offline: bool) {
        self.pipeline.set_offline(offline);
    }
}

impl<P: BurstPipeline> fmt::Display for TwoTierConvolver<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: impulse {} samples, small {} x {}, large {} x {} (factor {})",
            self.kind,
            self.impulse_size(),
            self.small_size,
            self.small_fragment_count(),
            self.large_fragment_size(),
            self.large_fragments,
            self.factor,
        )
    }
}

impl<P: BurstPipeline> fmt::Debug for TwoTierConvolver<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoTierConvolver")
            .field("kind", &self.kind)
            .field("small_size", &self.small_size)
            .field("factor", &self.factor)
            .field("impulse_size", &self.impulse_size())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        convolver::SingleTierConvolver,
        test_support::{direct_convolution, noise, TOLERANCE},
    };

    fn run(convolver: &mut dyn Convolver, input: &[Sample], chunk: usize) -> Vec<Sample> {
        let mut output = vec![0.0; input.len()];
        let mut scratch = vec![0.0; input.len()];
        for ((block, out), out_r) in input
            .chunks(chunk)
            .zip(output.chunks_mut(chunk))
            .zip(scratch.chunks_mut(chunk))
        {
            convolver.process(block, block, out, out_r).unwrap();
        }
        output
    }

    fn threaded(small: usize, factor: usize, ir: &[Sample]) -> ThreadedTwoTierConvolver {
        let mut convolver = ThreadedTwoTierConvolver::new(small, factor).unwrap();
        convolver.set_offline(true);
        convolver.load(ir, ir).unwrap();
        convolver.resume().unwrap();
        convolver
    }

    #[test]
    fn splits_the_response_into_two_tiers() {
        let ir = noise(1000, 1);
        let mut convolver = SyncTwoTierConvolver::new(16, 4).unwrap();
        convolver.load(&ir, &ir).unwrap();

        assert_eq!(convolver.large_fragment_size(), 64);
        // Head covers 128 samples, the tail the remaining 872.
        assert_eq!(convolver.small_fragment_count(), 8);
        assert_eq!(convolver.large_fragment_count(), 14);
        assert_eq!(convolver.latency(), 0);
        assert_eq!(
            convolver.to_string(),
            "two-tier: impulse 1000 samples, small 16 x 8, large 64 x 14 (factor 4)"
        );
    }

    #[test]
    fn long_response_matches_direct_convolution() {
        let ir = noise(700, 2);
        let input = noise(2000, 3);
        let expected = direct_convolution(&input, &ir);

        for chunk in [1, 10, 16, 100, 2000] {
            let mut convolver = SyncTwoTierConvolver::new(16, 4).unwrap();
            convolver.load(&ir, &ir).unwrap();
            let output = run(&mut convolver, &input, chunk);
            for (got, want) in output.iter().zip(&expected) {
                assert_abs_diff_eq!(*got, *want, epsilon = TOLERANCE);
            }
        }
    }

    #[test]
    fn factor_one_matches_the_single_tier_engines() {
        let ir = noise(333, 4);
        let input = noise(1200, 5);

        let mut two_tier = SyncTwoTierConvolver::new(32, 1).unwrap();
        let mut buffered = SingleTierConvolver::new(32).unwrap();
        let mut immediate = SingleTierConvolver::zero_latency(32).unwrap();
        two_tier.load(&ir, &ir).unwrap();
        buffered.load(&ir, &ir).unwrap();
        immediate.load(&ir, &ir).unwrap();

        let out_two = run(&mut two_tier, &input, 32);
        let out_buffered = run(&mut buffered, &input, 32);
        let out_immediate = run(&mut immediate, &input, 32);

        for i in 0..input.len() {
            assert_abs_diff_eq!(out_two[i], out_immediate[i], epsilon = TOLERANCE);
            if i >= 32 {
                assert_abs_diff_eq!(out_two[i - 32], out_buffered[i], epsilon = TOLERANCE);
            }
        }
    }

    #[test]
    fn threaded_engine_is_sample_identical_to_inline() {
        let ir = noise(900, 6);
        let input = noise(3000, 7);

        let mut inline = SyncTwoTierConvolver::new(16, 4).unwrap();
        inline.load(&ir, &ir).unwrap();
        let mut worker = threaded(16, 4, &ir);

        for chunk in [16, 23] {
            inline.mute().unwrap();
            worker.mute().unwrap();
            assert_eq!(run(&mut worker, &input, chunk), run(&mut inline, &input, chunk));
        }
    }

    #[test]
    fn reload_resets_all_state() {
        let ir = noise(500, 8);
        let input = noise(1000, 9);

        let mut fresh = SyncTwoTierConvolver::new(8, 4).unwrap();
        fresh.load(&ir, &ir).unwrap();
        let expected = run(&mut fresh, &input, 8);

        let mut reused = threaded(8, 4, &ir);
        run(&mut reused, &noise(300, 10), 7);
        reused.suspend().unwrap();
        reused.unload().unwrap();
        assert!(!reused.is_loaded());
        reused.load(&ir, &ir).unwrap();
        reused.resume().unwrap();
        assert_eq!(run(&mut reused, &input, 8), expected);
    }

    #[test]
    fn short_responses_skip_the_tail() {
        let ir = noise(50, 11);
        let input = noise(200, 12);
        let expected = direct_convolution(&input, &ir);

        let mut convolver = SyncTwoTierConvolver::new(8, 4).unwrap();
        convolver.load(&ir, &ir).unwrap();
        assert_eq!(convolver.large_fragment_count(), 0);

        let output = run(&mut convolver, &input, 13);
        for (got, want) in output.iter().zip(&expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = TOLERANCE);
        }
    }

    #[test]
    fn resizing_keeps_the_response() {
        let ir = noise(400, 13);
        let input = noise(800, 14);
        let expected = direct_convolution(&input, &ir);

        let mut convolver = SyncTwoTierConvolver::new(16, 2).unwrap();
        convolver.load(&ir, &ir).unwrap();
        convolver.set_fragment_size(8, 8).unwrap();
        assert_eq!(convolver.large_fragment_size(), 64);
        assert_eq!(convolver.impulse_size(), 400);

        let output = run(&mut convolver, &input, 50);
        for (got, want) in output.iter().zip(&expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = TOLERANCE);
        }
        assert!(convolver.set_fragment_size(8, 0).is_err());
    }

    #[test]
    fn threaded_engine_reports_misuse() {
        let ir = noise(300, 15);
        let mut convolver = ThreadedTwoTierConvolver::new(8, 4).unwrap();
        convolver.load(&ir, &ir).unwrap();

        let mut out = [0.0; 8];
        let mut out_r = [0.0; 8];
        let err = convolver
            .process(&[0.0; 8], &[0.0; 8], &mut out, &mut out_r)
            .unwrap_err();
        assert!(matches!(err, ImpulserError::Suspended));

        convolver.resume().unwrap();
        let err = convolver.load(&ir, &ir).unwrap_err();
        assert!(matches!(err, ImpulserError::Precondition(_)));
        let err = convolver.unload().unwrap_err();
        assert!(matches!(err, ImpulserError::Precondition(_)));
        let err = convolver.set_fragment_size(16, 4).unwrap_err();
        assert!(matches!(err, ImpulserError::Precondition(_)));

        // Still loaded and usable after the rejected calls.
        convolver
            .process(&[0.0; 8], &[0.0; 8], &mut out, &mut out_r)
            .unwrap();
        assert_eq!(convolver.overrun_count(), 0);
    }
}
