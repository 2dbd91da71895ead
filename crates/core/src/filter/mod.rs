//! One-pole post filter for the wet signal.

use crate::Sample;

/// One-pole smoother `state += (x - state) * coeff`.
#[derive(Debug, Clone, Copy, Default)]
struct OnePole {
    coeff: Sample,
    state: Sample,
}

impl OnePole {
    /// Coefficient for a -3 dB point at `cutoff` Hz; zero disables the pole.
    fn set_cutoff(&mut self, cutoff: Sample, sample_rate: Sample) {
        self.coeff = if cutoff > 0.0 && sample_rate > 0.0 {
            let omega = std::f64::consts::TAU as Sample * cutoff / sample_rate;
            1.0 - (-omega).exp()
        } else {
            0.0
        };
    }

    #[inline]
    fn smooth(&mut self, input: Sample) -> Sample {
        self.state += (input - self.state) * self.coeff;
        self.state
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    lowpass: OnePole,
    highpass: OnePole,
}

/// Low-pass followed by high-pass, one instance per channel.
///
/// Cutoffs are in Hz; a cutoff of zero bypasses that stage.
#[derive(Debug, Clone)]
pub struct PostFilter {
    sample_rate: Sample,
    lpf: Sample,
    hpf: Sample,
    left: Channel,
    right: Channel,
}

impl PostFilter {
    pub fn new(sample_rate: Sample) -> Self {
        Self {
            sample_rate,
            lpf: 0.0,
            hpf: 0.0,
            left: Channel::default(),
            right: Channel::default(),
        }
    }

    pub fn sample_rate(&self) -> Sample {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: Sample) {
        self.sample_rate = sample_rate;
        self.update();
    }

    pub fn lpf(&self) -> Sample {
        self.lpf
    }

    pub fn set_lpf(&mut self, cutoff: Sample) {
        self.lpf = cutoff.max(0.0);
        self.update();
    }

    pub fn hpf(&self) -> Sample {
        self.hpf
    }

    pub fn set_hpf(&mut self, cutoff: Sample) {
        self.hpf = cutoff.max(0.0);
        self.update();
    }

    fn update(&mut self) {
        for channel in [&mut self.left, &mut self.right] {
            channel.lowpass.set_cutoff(self.lpf, self.sample_rate);
            channel.highpass.set_cutoff(self.hpf, self.sample_rate);
        }
    }

    /// Filters both channels in place.
    pub fn process(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        let (lpf, hpf) = (self.lpf > 0.0, self.hpf > 0.0);
        if !lpf && !hpf {
            return;
        }
        for (samples, channel) in [(left, &mut self.left), (right, &mut self.right)] {
            for sample in samples.iter_mut() {
                let mut value = *sample;
                if lpf {
                    value = channel.lowpass.smooth(value);
                }
                if hpf {
                    value -= channel.highpass.smooth(value);
                }
                *sample = value;
            }
        }
    }

    pub fn mute(&mut self) {
        for channel in [&mut self.left, &mut self.right] {
            channel.lowpass.state = 0.0;
            channel.highpass.state = 0.0;
        }
    }
}
