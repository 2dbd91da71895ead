use crate::{buffer::try_zeroed, Result, Sample};

/// Fixed-length circular delay. A length of zero passes samples through.
#[derive(Debug, Clone, Default)]
pub struct DelayLine {
    buffer: Vec<Sample>,
    index: usize,
}

impl DelayLine {
    pub fn new(len: usize) -> Result<Self> {
        let mut line = Self::default();
        line.set_len(len)?;
        Ok(line)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Resizes the line. The stored signal is discarded.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len == self.buffer.len() {
            self.mute();
            return Ok(());
        }
        self.buffer = try_zeroed(len)?;
        self.index = 0;
        Ok(())
    }

    /// Pushes one sample and returns the one that entered `len` calls ago.
    #[inline]
    pub fn process(&mut self, input: Sample) -> Sample {
        if self.buffer.is_empty() {
            return input;
        }
        let output = std::mem::replace(&mut self.buffer[self.index], input);
        self.index += 1;
        if self.index == self.buffer.len() {
            self.index = 0;
        }
        output
    }

    /// Delays a whole block in place.
    pub fn process_block(&mut self, block: &mut [Sample]) {
        if self.buffer.is_empty() {
            return;
        }
        for sample in block {
            *sample = self.process(*sample);
        }
    }

    pub fn mute(&mut self) {
        self.buffer.fill(0.0);
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_by_its_length() {
        let mut line = DelayLine::new(3).unwrap();
        let output: Vec<Sample> = (1..=6).map(|i| line.process(i as Sample)).collect();
        assert_eq!(output, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_length_passes_through() {
        let mut line = DelayLine::new(0).unwrap();
        let mut block = [1.0, 2.0, 3.0];
        line.process_block(&mut block);
        assert_eq!(block, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn resizing_and_muting_clear_the_line() {
        let mut line = DelayLine::new(2).unwrap();
        line.process(5.0);
        line.mute();
        assert_eq!(line.process(0.0), 0.0);

        line.process(7.0);
        line.set_len(4).unwrap();
        let mut block = [1.0; 5];
        line.process_block(&mut block);
        assert_eq!(block, [0.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
