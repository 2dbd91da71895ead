use crate::{spectrum::SpectrumTransform, Result, Sample, StereoBuffer};

/// `acc += a * b` over packed half-complex spectra of length `2n`.
///
/// Only the `n + 1` unique bins of a real signal are touched: DC and Nyquist
/// are real products, bins `1..n` are full complex products with the real
/// part at `k` and the imaginary part at `n + k`.
pub fn multiply_accumulate(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    let len = acc.len();
    debug_assert!(len >= 2 && len % 2 == 0);
    debug_assert_eq!(a.len(), len);
    debug_assert_eq!(b.len(), len);
    let n = len / 2;

    acc[0] += a[0] * b[0];
    acc[n] += a[n] * b[n];

    let (acc_re, acc_im) = acc.split_at_mut(n + 1);
    let (a_re, a_im) = (&a[1..n], &a[n + 1..]);
    let (b_re, b_im) = (&b[1..n], &b[n + 1..]);
    let bins = acc_re[1..n]
        .iter_mut()
        .zip(acc_im.iter_mut())
        .zip(a_re.iter().zip(a_im))
        .zip(b_re.iter().zip(b_im));
    for (((re, im), (ar, ai)), (br, bi)) in bins {
        *re += ar * br - ai * bi;
        *im += ar * bi + ai * br;
    }
}

/// One frequency-domain slice of an impulse response.
///
/// Holds the normalised packed spectrum (both channels) of at most
/// `block_size` IR samples, zero-padded to `2 * block_size`.
#[derive(Debug, Default, Clone)]
pub struct Fragment {
    spectrum: StereoBuffer,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transforms an IR slice into this fragment. An empty slice leaves the
    /// fragment untouched.
    pub fn load(
        &mut self,
        transform: &mut SpectrumTransform,
        left: &[Sample],
        right: &[Sample],
    ) -> Result<()> {
        if left.is_empty() && right.is_empty() {
            return Ok(());
        }

        let mut spectrum = StereoBuffer::zeroed(transform.len())?;
        transform.forward_pair(left, right, &mut spectrum)?;

        let scale = 1.0 / transform.len() as Sample;
        for value in spectrum.left.iter_mut().chain(spectrum.right.iter_mut()) {
            *value *= scale;
        }

        self.spectrum = spectrum;
        Ok(())
    }

    /// Releases the spectrum storage.
    pub fn unload(&mut self) {
        self.spectrum.release();
    }

    pub fn is_loaded(&self) -> bool {
        !self.spectrum.is_empty()
    }

    /// Packed spectrum length, `2 * block_size`, or zero when unloaded.
    pub fn len(&self) -> usize {
        self.spectrum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectrum.is_empty()
    }

    /// Adds `self * input` into `acc`, channel by channel.
    pub fn multiply_accumulate(&self, input: &StereoBuffer, acc: &mut StereoBuffer) {
        if !self.is_loaded() {
            return;
        }
        multiply_accumulate(&self.spectrum.left, &input.left, &mut acc.left);
        multiply_accumulate(&self.spectrum.right, &input.right, &mut acc.right);
    }
}

/// Ring of the most recent input block spectra.
///
/// `get(0)` is the newest block, `get(age)` the one pushed `age` blocks
/// earlier. Pushing overwrites the oldest entry in place.
#[derive(Debug, Default)]
pub struct SpectrumHistory {
    slots: Vec<StereoBuffer>,
    newest: usize,
}

impl SpectrumHistory {
    /// Allocates `depth` zeroed spectra of `len` samples per channel.
    pub fn new(depth: usize, len: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(depth)
            .map_err(|_| crate::ImpulserError::Allocation { requested: depth })?;
        for _ in 0..depth {
            slots.push(StereoBuffer::zeroed(len)?);
        }
        Ok(Self { slots, newest: 0 })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Stores `spectrum` as the newest entry.
    pub fn push(&mut self, spectrum: &StereoBuffer) {
        if self.slots.is_empty() {
            return;
        }
        self.newest = if self.newest == 0 {
            self.slots.len() - 1
        } else {
            self.newest - 1
        };
        self.slots[self.newest].copy_from(spectrum);
    }

    /// Spectrum pushed `age` blocks ago.
    pub fn get(&self, age: usize) -> &StereoBuffer {
        &self.slots[(self.newest + age) % self.slots.len()]
    }

    pub fn mute(&mut self) {
        for slot in &mut self.slots {
            slot.mute();
        }
        self.newest = 0;
    }
}
