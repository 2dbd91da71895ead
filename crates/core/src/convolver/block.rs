use tracing::debug;

use super::{frame_count, Convolver, ConvolverKind};
use crate::{
    fragment::Fragment, spectrum::SpectrumTransform, ImpulseResponse, ImpulserError, Result,
    Sample, StereoBuffer,
};

/// Convolver that transforms the whole response as one block.
///
/// Input is collected in blocks of `impulse_size` samples and convolved with
/// a single transform of twice the padded response length, so the latency
/// equals the response length. Cheap for short responses, impractical for
/// long ones.
#[derive(Debug, Default)]
pub struct SingleBlockConvolver {
    impulse: Option<ImpulseResponse>,
    transform: Option<SpectrumTransform>,
    kernel: Fragment,
    pending: StereoBuffer,
    ready: StereoBuffer,
    /// Second half of the previous block's result.
    overlap: StereoBuffer,
    spectrum: StereoBuffer,
    product: StereoBuffer,
    time: StereoBuffer,
    position: usize,
}

impl SingleBlockConvolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn block_len(&self) -> usize {
        self.impulse.as_ref().map_or(0, ImpulseResponse::len)
    }

    fn release(&mut self) {
        *self = Self::default();
    }

    fn rebuild(&mut self, impulse: ImpulseResponse) -> Result<()> {
        self.release();

        let len = impulse.len();
        let padded = len
            .checked_next_power_of_two()
            .ok_or(ImpulserError::InvalidInput("impulse response is too long"))?;
        let mut transform = SpectrumTransform::new(padded)?;
        let mut kernel = Fragment::new();
        kernel.load(&mut transform, impulse.left(), impulse.right())?;

        self.pending = StereoBuffer::zeroed(len)?;
        self.ready = StereoBuffer::zeroed(len)?;
        self.overlap = StereoBuffer::zeroed(len)?;
        self.spectrum = StereoBuffer::zeroed(transform.len())?;
        self.product = StereoBuffer::zeroed(transform.len())?;
        self.time = StereoBuffer::zeroed(transform.len())?;
        debug!(impulse = len, block = padded, "loaded single-block response");

        self.transform = Some(transform);
        self.kernel = kernel;
        self.impulse = Some(impulse);
        Ok(())
    }

    /// Convolves the collected block into `ready` and keeps the overlap.
    fn convolve_block(&mut self) -> Result<()> {
        let len = self.block_len();
        let transform = self.transform.as_mut().ok_or(ImpulserError::NotLoaded)?;
        transform.forward_pair(&self.pending.left, &self.pending.right, &mut self.spectrum)?;
        self.product.mute();
        self.kernel.multiply_accumulate(&self.spectrum, &mut self.product);
        transform.inverse_pair(&self.product, &mut self.time)?;

        for (time, ready, overlap) in [
            (&self.time.left, &mut self.ready.left, &mut self.overlap.left),
            (&self.time.right, &mut self.ready.right, &mut self.overlap.right),
        ] {
            for ((out, carry), value) in ready.iter_mut().zip(overlap.iter()).zip(&time[..len]) {
                *out = value + carry;
            }
            overlap.copy_from_slice(&time[len..2 * len]);
        }
        Ok(())
    }
}

impl Convolver for SingleBlockConvolver {
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
        self.release();
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.impulse.is_some()
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
        if !self.is_loaded() {
            return Err(ImpulserError::NotLoaded);
        }
        let block = self.block_len();

        let mut offset = 0;
        while offset < n {
            let len = (block - self.position).min(n - offset);
            let range = offset..offset + len;
            let slot = self.position..self.position + len;
            self.pending.left[slot.clone()].copy_from_slice(&in_l[range.clone()]);
            self.pending.right[slot.clone()].copy_from_slice(&in_r[range.clone()]);
            out_l[range.clone()].copy_from_slice(&self.ready.left[slot.clone()]);
            out_r[range].copy_from_slice(&self.ready.right[slot]);

            self.position += len;
            if self.position == block {
                self.convolve_block()?;
                self.position = 0;
            }
            offset += len;
        }
        Ok(())
    }

    fn mute(&mut self) -> Result<()> {
        for buffer in [&mut self.pending, &mut self.ready, &mut self.overlap] {
            buffer.mute();
        }
        self.position = 0;
        Ok(())
    }

    /// The block size follows the response, so the request is ignored.
    fn set_fragment_size(&mut self, _fragment_size: usize, _factor: usize) -> Result<()> {
        Ok(())
    }

    fn latency(&self) -> usize {
        self.block_len()
    }

    fn impulse_size(&self) -> usize {
        self.block_len()
    }

    fn fragment_size(&self) -> usize {
        self.transform.as_ref().map_or(0, SpectrumTransform::block_size)
    }

    fn kind(&self) -> ConvolverKind {
        ConvolverKind::SingleBlock
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::test_support::{direct_convolution, noise, TOLERANCE};

    fn run(convolver: &mut SingleBlockConvolver, input: &[Sample], chunk: usize) -> Vec<Sample> {
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

    #[test]
    fn latency_is_the_response_length() {
        let ir = noise(100, 31);
        let input = noise(700, 32);
        let expected = direct_convolution(&input, &ir);

        let mut convolver = SingleBlockConvolver::new();
        convolver.load(&ir, &ir).unwrap();
        assert_eq!(convolver.latency(), 100);
        assert_eq!(convolver.fragment_size(), 128);

        let output = run(&mut convolver, &input, 33);
        assert!(output[..100].iter().all(|s| *s == 0.0));
        for i in 100..input.len() {
            assert_abs_diff_eq!(output[i], expected[i - 100], epsilon = TOLERANCE);
        }
    }

    #[test]
    fn chunking_does_not_change_a_single_bit() {
        let ir = noise(64, 33);
        let input = noise(500, 34);

        let mut whole = SingleBlockConvolver::new();
        whole.load(&ir, &ir).unwrap();
        let reference = run(&mut whole, &input, 500);

        for chunk in [1, 7, 64, 65] {
            let mut split = SingleBlockConvolver::new();
            split.load(&ir, &ir).unwrap();
            assert_eq!(run(&mut split, &input, chunk), reference, "{chunk}");
        }
    }

    #[test]
    fn mute_and_unload_reset_the_engine() {
        let ir = noise(20, 35);
        let input = noise(90, 36);

        let mut convolver = SingleBlockConvolver::new();
        convolver.load(&ir, &ir).unwrap();
        let first = run(&mut convolver, &input, 9);
        convolver.mute().unwrap();
        assert_eq!(run(&mut convolver, &input, 9), first);

        convolver.unload().unwrap();
        assert!(!convolver.is_loaded());
        assert_eq!(convolver.latency(), 0);
        assert_eq!(convolver.fragment_size(), 0);
    }
}
