use std::ops::Range;

use crate::{ImpulserError, Result, Sample};

/// Allocates a zero-filled buffer, reporting allocation failure instead of
/// aborting the process.
pub fn try_zeroed(len: usize) -> Result<Vec<Sample>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| ImpulserError::Allocation { requested: len })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

/// Pair of equally sized left/right channel buffers.
///
/// Every per-channel scratch area in the engine (input windows, spectra,
/// accumulators, overlap buffers) is one of these, so both channels are
/// always allocated, muted and released together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    pub left: Vec<Sample>,
    pub right: Vec<Sample>,
}

impl StereoBuffer {
    /// Allocates two zeroed channels of `len` samples each.
    pub fn zeroed(len: usize) -> Result<Self> {
        Ok(Self {
            left: try_zeroed(len)?,
            right: try_zeroed(len)?,
        })
    }

    /// Copies both channels into a fresh buffer.
    pub fn from_channels(left: &[Sample], right: &[Sample]) -> Result<Self> {
        if left.len() != right.len() {
            return Err(ImpulserError::InvalidInput(
                "left and right channels must have the same length",
            ));
        }
        let mut buffer = Self::zeroed(left.len())?;
        buffer.left.copy_from_slice(left);
        buffer.right.copy_from_slice(right);
        Ok(buffer)
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Zeroes both channels.
    pub fn mute(&mut self) {
        self.left.fill(0.0);
        self.right.fill(0.0);
    }

    /// Zeroes `range` in both channels.
    pub fn mute_range(&mut self, range: Range<usize>) {
        self.left[range.clone()].fill(0.0);
        self.right[range].fill(0.0);
    }

    /// Copies the contents of `other`, which must be the same length.
    pub fn copy_from(&mut self, other: &StereoBuffer) {
        self.left.copy_from_slice(&other.left);
        self.right.copy_from_slice(&other.right);
    }

    /// Frees the storage of both channels.
    pub fn release(&mut self) {
        self.left = Vec::new();
        self.right = Vec::new();
    }
}

/// De-interleaved stereo impulse response.
///
/// Owned by the convolver that loaded it so the partition can be rebuilt
/// when the fragment size changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpulseResponse {
    channels: StereoBuffer,
}

impl ImpulseResponse {
    /// Copies a stereo impulse response.
    pub fn new(left: &[Sample], right: &[Sample]) -> Result<Self> {
        Ok(Self {
            channels: StereoBuffer::from_channels(left, right)?,
        })
    }

    /// Uses the same response on both channels.
    pub fn mono(samples: &[Sample]) -> Result<Self> {
        Self::new(samples, samples)
    }

    /// Splits interleaved frames. Mono input is duplicated to both channels
    /// and channels beyond the second are ignored.
    pub fn from_interleaved(samples: &[Sample], channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(ImpulserError::InvalidInput(
                "interleaved audio needs at least one channel",
            ));
        }
        let frames = samples.len() / channels;
        let mut buffer = StereoBuffer::zeroed(frames)?;
        for (frame, chunk) in samples.chunks_exact(channels).enumerate() {
            buffer.left[frame] = chunk[0];
            buffer.right[frame] = if channels > 1 { chunk[1] } else { chunk[0] };
        }
        Ok(Self { channels: buffer })
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn left(&self) -> &[Sample] {
        &self.channels.left
    }

    pub fn right(&self) -> &[Sample] {
        &self.channels.right
    }

    /// Scales both channels by a linear gain.
    pub fn scale(&mut self, gain: Sample) {
        for sample in self
            .channels
            .left
            .iter_mut()
            .chain(self.channels.right.iter_mut())
        {
            *sample *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_buffers_are_muted() {
        let mut buffer = StereoBuffer::zeroed(8).unwrap();
        assert_eq!(buffer.len(), 8);
        assert!(buffer.left.iter().chain(&buffer.right).all(|s| *s == 0.0));

        buffer.left[3] = 1.0;
        buffer.right[5] = 2.0;
        buffer.mute_range(0..4);
        assert_eq!(buffer.left[3], 0.0);
        assert_eq!(buffer.right[5], 2.0);

        buffer.release();
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_mismatched_channels() {
        let err = StereoBuffer::from_channels(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert!(matches!(err, ImpulserError::InvalidInput(_)));
    }

    #[test]
    fn splits_interleaved_frames() {
        let ir = ImpulseResponse::from_interleaved(&[1.0, 2.0, 3.0, 4.0, 5.0], 2).unwrap();
        assert_eq!(ir.len(), 2);
        assert_eq!(ir.left(), &[1.0, 3.0]);
        assert_eq!(ir.right(), &[2.0, 4.0]);

        let mono = ImpulseResponse::from_interleaved(&[0.5, 0.25], 1).unwrap();
        assert_eq!(mono.left(), mono.right());
    }

    #[test]
    fn reports_impossible_allocations() {
        let err = try_zeroed(usize::MAX).unwrap_err();
        assert!(matches!(err, ImpulserError::Allocation { .. }));
    }
}
