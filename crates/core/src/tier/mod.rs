//! Uniformly partitioned convolution over one block size.
//!
//! The impulse response is cut into fragments of `block` samples. Fragment
//! `i` is multiplied against the input spectrum that is `i` blocks old, so a
//! single `2 * block` transform per input block convolves against the whole
//! response. Output leaves the tier in the same call that delivered the
//! input: the current, partially filled block is re-transformed on every
//! call and multiplied with fragment 0, while the older fragments are summed
//! once per block into `rest`.

use tracing::debug;

use crate::{
    fragment::{Fragment, SpectrumHistory},
    spectrum::SpectrumTransform,
    ImpulserError, Result, Sample, StereoBuffer,
};

#[derive(Debug)]
pub struct PartitionedTier {
    block: usize,
    transform: SpectrumTransform,
    fragments: Vec<Fragment>,
    history: SpectrumHistory,
    /// Time-domain samples of the block being filled.
    input: StereoBuffer,
    fill: usize,
    /// Packed spectrum of `input`.
    spectrum: StereoBuffer,
    /// Sum of fragments `1..` against older blocks, valid for the whole
    /// current block.
    rest: StereoBuffer,
    accumulator: StereoBuffer,
    time: StereoBuffer,
    /// Double-length overlap-add buffer. `half` is the half that lines up
    /// with the current block; the other half collects the tail.
    overlap: StereoBuffer,
    half: usize,
}

impl PartitionedTier {
    /// Partitions an impulse response into fragments of `block` samples.
    ///
    /// The fragment count is `ceil(len / block)`, the last one zero-padded.
    /// Every buffer is allocated here and reused by [`process`](Self::process).
    pub fn new(left: &[Sample], right: &[Sample], block: usize) -> Result<Self> {
        if left.len() != right.len() {
            return Err(ImpulserError::InvalidInput(
                "left and right impulse responses must have the same length",
            ));
        }
        if left.is_empty() {
            return Err(ImpulserError::InvalidInput("impulse response is empty"));
        }

        let mut transform = SpectrumTransform::new(block)?;
        let count = left.len().div_ceil(block);

        let mut fragments = Vec::new();
        fragments
            .try_reserve_exact(count)
            .map_err(|_| ImpulserError::Allocation { requested: count })?;
        for (slice_l, slice_r) in left.chunks(block).zip(right.chunks(block)) {
            let mut fragment = Fragment::new();
            fragment.load(&mut transform, slice_l, slice_r)?;
            fragments.push(fragment);
        }

        let spectrum_len = transform.len();
        debug!(block, fragments = count, "partitioned impulse response");

        Ok(Self {
            block,
            history: SpectrumHistory::new(count.saturating_sub(1).max(1), spectrum_len)?,
            input: StereoBuffer::zeroed(block)?,
            fill: 0,
            spectrum: StereoBuffer::zeroed(spectrum_len)?,
            rest: StereoBuffer::zeroed(spectrum_len)?,
            accumulator: StereoBuffer::zeroed(spectrum_len)?,
            time: StereoBuffer::zeroed(spectrum_len)?,
            overlap: StereoBuffer::zeroed(spectrum_len)?,
            half: 0,
            transform,
            fragments,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Samples already collected for the current block.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Samples that can still be accepted before the current block closes.
    pub fn remaining(&self) -> usize {
        self.block - self.fill
    }

    /// Clears all signal state. Fragments are kept as they are.
    pub fn mute(&mut self) {
        self.history.mute();
        self.input.mute();
        self.fill = 0;
        self.spectrum.mute();
        self.rest.mute();
        self.accumulator.mute();
        self.time.mute();
        self.overlap.mute();
        self.half = 0;
    }

    /// Convolves `n` new samples and replaces the `n` output samples.
    ///
    /// `n` must not exceed [`remaining`](Self::remaining); callers split
    /// their buffers at block boundaries.
    pub fn process(
        &mut self,
        in_l: &[Sample],
        in_r: &[Sample],
        out_l: &mut [Sample],
        out_r: &mut [Sample],
    ) -> Result<()> {
        let n = in_l.len();
        if n == 0 {
            return Ok(());
        }
        if n > self.remaining() || in_r.len() != n || out_l.len() != n || out_r.len() != n {
            return Err(ImpulserError::InvalidInput(
                "tier input must stay within one block and match the output length",
            ));
        }

        if self.fill == 0 {
            self.accumulate_rest();
        }

        let start = self.fill;
        self.input.left[start..start + n].copy_from_slice(in_l);
        self.input.right[start..start + n].copy_from_slice(in_r);

        self.transform
            .forward_pair(&self.input.left, &self.input.right, &mut self.spectrum)?;
        self.accumulator.copy_from(&self.rest);
        self.fragments[0].multiply_accumulate(&self.spectrum, &mut self.accumulator);
        self.transform
            .inverse_pair(&self.accumulator, &mut self.time)?;

        let tail = self.half + start;
        for i in 0..n {
            out_l[i] = self.time.left[start + i] + self.overlap.left[tail + i];
            out_r[i] = self.time.right[start + i] + self.overlap.right[tail + i];
        }

        self.fill += n;
        if self.fill == self.block {
            self.close_block();
        }
        Ok(())
    }

    fn accumulate_rest(&mut self) {
        self.rest.mute();
        for (age, fragment) in self.fragments.iter().enumerate().skip(1) {
            fragment.multiply_accumulate(self.history.get(age - 1), &mut self.rest);
        }
    }

    fn close_block(&mut self) {
        let block = self.block;
        let current = self.half;
        let next = block - current;

        // The half just emitted becomes the tail collector; the second half
        // of the final inverse transform spills into the next block.
        self.overlap.mute_range(current..current + block);
        for i in 0..block {
            self.overlap.left[next + i] += self.time.left[block + i];
            self.overlap.right[next + i] += self.time.right[block + i];
        }
        self.half = next;

        self.history.push(&self.spectrum);
        self.input.mute();
        self.fill = 0;
    }
}
