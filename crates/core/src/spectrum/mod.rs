//! Real-to-half-complex transforms of a fixed length.
//!
//! A [`SpectrumTransform`] owns the forward and inverse plans for blocks of
//! `n` samples, transformed at length `2n` so that the circular convolution
//! of two zero-padded blocks equals their linear convolution. Spectra are
//! kept in a packed layout of `2n` real values:
//!
//! ```text
//! index:  0     1     ...  n     n+1   ...  2n-1
//! value:  re_0  re_1  ...  re_n  im_1  ...  im_(n-1)
//! ```
//!
//! `im_0` and `im_n` are always zero for real input, so nothing is lost. The
//! real and imaginary parts of bin `k` sit at `k` and `n + k`, which keeps
//! the multiply-accumulate kernel on stride-1 data.

use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex, ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{buffer::try_zeroed, ImpulserError, Result, Sample, StereoBuffer};

/// Packs `n + 1` complex bins into `2n` reals.
pub fn pack(bins: &[Complex<Sample>], packed: &mut [Sample]) {
    let n = bins.len() - 1;
    debug_assert_eq!(packed.len(), 2 * n);
    let (re, im) = packed.split_at_mut(n + 1);
    for (slot, bin) in re.iter_mut().zip(bins) {
        *slot = bin.re;
    }
    for (slot, bin) in im.iter_mut().zip(&bins[1..n]) {
        *slot = bin.im;
    }
}

/// Inverse of [`pack`]. The DC and Nyquist bins come back purely real.
pub fn unpack(packed: &[Sample], bins: &mut [Complex<Sample>]) {
    let n = bins.len() - 1;
    debug_assert_eq!(packed.len(), 2 * n);
    let (re, im) = packed.split_at(n + 1);
    bins[0] = Complex::new(re[0], 0.0);
    bins[n] = Complex::new(re[n], 0.0);
    for k in 1..n {
        bins[k] = Complex::new(re[k], im[k - 1]);
    }
}

/// Forward/inverse plans plus the scratch space they need.
pub struct SpectrumTransform {
    block_size: usize,
    forward: Arc<dyn RealToComplex<Sample>>,
    inverse: Arc<dyn ComplexToReal<Sample>>,
    time: Vec<Sample>,
    bins: Vec<Complex<Sample>>,
    forward_scratch: Vec<Complex<Sample>>,
    inverse_scratch: Vec<Complex<Sample>>,
}

impl SpectrumTransform {
    /// Plans transforms of length `2 * block_size`.
    ///
    /// Nothing is kept if any allocation fails, so a caller that fails to
    /// build a replacement still owns its previous transform untouched.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(ImpulserError::InvalidInput("block size must be positive"));
        }

        let len = 2 * block_size;
        let mut planner = RealFftPlanner::<Sample>::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);

        let time = try_zeroed(len)?;
        let bins = try_complex(block_size + 1)?;
        let forward_scratch = try_complex(forward.get_scratch_len())?;
        let inverse_scratch = try_complex(inverse.get_scratch_len())?;

        Ok(Self {
            block_size,
            forward,
            inverse,
            time,
            bins,
            forward_scratch,
            inverse_scratch,
        })
    }

    /// Block size `n` the transform was planned for.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Transform length, `2n`.
    pub fn len(&self) -> usize {
        2 * self.block_size
    }

    /// Zero-pads `input` (at most `2n` samples) and writes its packed
    /// spectrum into `packed`.
    pub fn forward(&mut self, input: &[Sample], packed: &mut [Sample]) -> Result<()> {
        let len = self.len();
        if input.len() > len || packed.len() != len {
            return Err(ImpulserError::InvalidInput(
                "forward transform buffers do not match the planned length",
            ));
        }

        self.time[..input.len()].copy_from_slice(input);
        self.time[input.len()..].fill(0.0);
        self.forward.process_with_scratch(
            &mut self.time,
            &mut self.bins,
            &mut self.forward_scratch,
        )?;
        pack(&self.bins, packed);
        Ok(())
    }

    /// Replaces `output` with the unnormalised inverse of a packed spectrum.
    pub fn inverse(&mut self, packed: &[Sample], output: &mut [Sample]) -> Result<()> {
        let len = self.len();
        if packed.len() != len || output.len() != len {
            return Err(ImpulserError::InvalidInput(
                "inverse transform buffers do not match the planned length",
            ));
        }

        unpack(packed, &mut self.bins);
        self.inverse
            .process_with_scratch(&mut self.bins, output, &mut self.inverse_scratch)?;
        Ok(())
    }

    /// Forward transform of a left/right pair.
    pub fn forward_pair(
        &mut self,
        left: &[Sample],
        right: &[Sample],
        packed: &mut StereoBuffer,
    ) -> Result<()> {
        self.forward(left, &mut packed.left)?;
        self.forward(right, &mut packed.right)
    }

    /// Inverse transform of a left/right pair.
    pub fn inverse_pair(&mut self, packed: &StereoBuffer, output: &mut StereoBuffer) -> Result<()> {
        self.inverse(&packed.left, &mut output.left)?;
        self.inverse(&packed.right, &mut output.right)
    }
}

fn try_complex(len: usize) -> Result<Vec<Complex<Sample>>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| ImpulserError::Allocation { requested: len })?;
    buffer.resize(len, Complex::new(0.0, 0.0));
    Ok(buffer)
}

impl fmt::Debug for SpectrumTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumTransform")
            .field("block_size", &self.block_size)
            .finish()
    }
}
