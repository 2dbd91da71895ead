use tracing::debug;

use super::{frame_count, Convolver, ConvolverKind};
use crate::{ImpulseResponse, ImpulserError, Result, Sample, StereoBuffer};

/// Time-domain convolver without any transform.
///
/// Every output sample is the dot product of the response with the last
/// `impulse_size` input samples, so there is no latency but the cost grows
/// with the response length. Meant for short responses and as a reference.
#[derive(Debug, Default)]
pub struct DirectConvolver {
    impulse: Option<ImpulseResponse>,
    /// Ring of past input, `history[newest]` is the latest sample.
    history: StereoBuffer,
    newest: usize,
}

/// `sum(ir[k] * x[t - k])` where `ring[newest]` holds `x[t]`.
#[inline]
fn dot(ir: &[Sample], ring: &[Sample], newest: usize) -> Sample {
    let (recent, older) = ring.split_at(newest + 1);
    let near: Sample = ir.iter().zip(recent.iter().rev()).map(|(h, x)| h * x).sum();
    let far: Sample = ir[recent.len()..]
        .iter()
        .zip(older.iter().rev())
        .map(|(h, x)| h * x)
        .sum();
    near + far
}

impl DirectConvolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn release(&mut self) {
        self.impulse = None;
        self.history.release();
        self.newest = 0;
    }
}

impl Convolver for DirectConvolver {
    fn load(&mut self, left: &[Sample], right: &[Sample]) -> Result<()> {
        if left.is_empty() && right.is_empty() {
            return Ok(());
        }
        self.release();
        let result = ImpulseResponse::new(left, right).and_then(|impulse| {
            self.history = StereoBuffer::zeroed(impulse.len())?;
            self.newest = impulse.len() - 1;
            debug!(impulse = impulse.len(), "loaded direct response");
            self.impulse = Some(impulse);
            Ok(())
        });
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
        let impulse = self.impulse.as_ref().ok_or(ImpulserError::NotLoaded)?;
        let len = impulse.len();

        for i in 0..n {
            self.newest = if self.newest + 1 == len { 0 } else { self.newest + 1 };
            self.history.left[self.newest] = in_l[i];
            self.history.right[self.newest] = in_r[i];
            out_l[i] = dot(impulse.left(), &self.history.left, self.newest);
            out_r[i] = dot(impulse.right(), &self.history.right, self.newest);
        }
        Ok(())
    }

    fn mute(&mut self) -> Result<()> {
        self.history.mute();
        Ok(())
    }

    /// There are no blocks, so the request is ignored.
    fn set_fragment_size(&mut self, _fragment_size: usize, _factor: usize) -> Result<()> {
        Ok(())
    }

    fn latency(&self) -> usize {
        0
    }

    fn impulse_size(&self) -> usize {
        self.impulse.as_ref().map_or(0, ImpulseResponse::len)
    }

    fn fragment_size(&self) -> usize {
        0
    }

    fn kind(&self) -> ConvolverKind {
        ConvolverKind::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convolves_sample_by_sample() {
        let mut convolver = DirectConvolver::new();
        convolver.load(&[1.0, 2.0, 3.0], &[0.0, 1.0, 0.0]).unwrap();

        let input = [1.0, 0.0, 0.0, 2.0, 1.0];
        let mut out_l = [0.0; 5];
        let mut out_r = [0.0; 5];
        convolver
            .process(&input[..2], &input[..2], &mut out_l[..2], &mut out_r[..2])
            .unwrap();
        convolver
            .process(&input[2..], &input[2..], &mut out_l[2..], &mut out_r[2..])
            .unwrap();

        assert_eq!(out_l, [1.0, 2.0, 3.0, 2.0, 5.0]);
        assert_eq!(out_r, [0.0, 1.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn mute_clears_the_input_history() {
        let mut convolver = DirectConvolver::new();
        convolver.load(&[1.0, 1.0], &[1.0, 1.0]).unwrap();
        let mut out_l = [0.0; 1];
        let mut out_r = [0.0; 1];
        convolver.process(&[4.0], &[4.0], &mut out_l, &mut out_r).unwrap();
        convolver.mute().unwrap();
        convolver.process(&[1.0], &[1.0], &mut out_l, &mut out_r).unwrap();
        assert_eq!(out_l, [1.0]);
        assert_eq!(convolver.latency(), 0);
        assert_eq!(convolver.impulse_size(), 2);
    }
}
