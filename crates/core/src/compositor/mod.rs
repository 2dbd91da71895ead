//! Wet/dry mixing around a convolution engine.
//!
//! The [`Compositor`] owns one [`Convolver`] and turns its wet output into
//! the final stereo signal: optional post filtering, an initial delay on
//! either the wet or the dry path, a width/balance matrix for the wet
//! signal and a latency-compensated dry path.

use std::ops::{BitOr, BitOrAssign};

use tracing::debug;

use crate::{
    convolver::{frame_count, Convolver},
    delay::DelayLine,
    filter::PostFilter,
    ImpulserError, Result, Sample, StereoBuffer,
};

/// Frames convolved per internal step; longer host buffers are split.
const SCRATCH_FRAMES: usize = 4096;

/// Per-call processing flags. Combine them with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProcessOptions(u32);

impl ProcessOptions {
    pub const DEFAULT: Self = Self(0);
    /// Leave the wet signal unfiltered.
    pub const SKIP_FILTER: Self = Self(1);
    pub const MUTE_DRY: Self = Self(1 << 1);
    pub const MUTE_WET: Self = Self(1 << 2);
    /// Add into the output buffers instead of overwriting them.
    pub const SKIP_INIT: Self = Self(1 << 3);
    /// Write the left mix to the right output and vice versa.
    pub const SWAP_LR: Self = Self(1 << 4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0b1_1111)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProcessOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProcessOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Converts decibels to a linear gain. `-inf` maps to zero.
pub fn db_to_ratio(db: Sample) -> Sample {
    (10.0 as Sample).powf(db / 20.0)
}

/// Converts a linear gain to decibels. Zero maps to `-inf`.
pub fn ratio_to_db(ratio: Sample) -> Sample {
    20.0 * ratio.abs().log10()
}

/// Dry and wet delay-line lengths for an engine latency and initial delay.
fn delay_lengths(latency: usize, initial_delay: i64) -> Result<(usize, usize)> {
    let too_long = || ImpulserError::InvalidInput("initial delay is too long");
    let wet = usize::try_from(initial_delay.max(0)).map_err(|_| too_long())?;
    let dry_extra = usize::try_from(initial_delay.min(0).unsigned_abs()).map_err(|_| too_long())?;
    let dry = latency.checked_add(dry_extra).ok_or_else(too_long)?;
    Ok((dry, wet))
}

/// Wet matrix coefficients derived from gain, width and balance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct WetMix {
    direct_l: Sample,
    cross_l: Sample,
    direct_r: Sample,
    cross_r: Sample,
}

impl WetMix {
    fn new(wet: Sample, width: Sample, balance: Sample) -> Self {
        let direct = wet * (width / 2.0 + 0.5);
        let cross = wet * ((1.0 - width) / 2.0);
        let left = if balance > 0.0 { 1.0 - balance } else { 1.0 };
        let right = if balance < 0.0 { 1.0 + balance } else { 1.0 };
        Self {
            direct_l: direct * left,
            cross_l: cross * left,
            direct_r: direct * right,
            cross_r: cross * right,
        }
    }
}

pub struct Compositor {
    convolver: Box<dyn Convolver>,
    wet_db: Sample,
    wet: Sample,
    dry_db: Sample,
    dry: Sample,
    width: Sample,
    lr_balance: Sample,
    mix: WetMix,
    filter: PostFilter,
    initial_delay: i64,
    dry_delay: [DelayLine; 2],
    wet_delay: [DelayLine; 2],
    options: ProcessOptions,
    scratch: StereoBuffer,
}

impl Compositor {
    /// Wraps `convolver` with unity wet and dry gain, full width, centred
    /// balance, no filtering and no initial delay.
    pub fn new(convolver: Box<dyn Convolver>, sample_rate: Sample) -> Result<Self> {
        let mut compositor = Self {
            convolver,
            wet_db: 0.0,
            wet: 1.0,
            dry_db: 0.0,
            dry: 1.0,
            width: 1.0,
            lr_balance: 0.0,
            mix: WetMix::new(1.0, 1.0, 0.0),
            filter: PostFilter::new(sample_rate),
            initial_delay: 0,
            dry_delay: [DelayLine::default(), DelayLine::default()],
            wet_delay: [DelayLine::default(), DelayLine::default()],
            options: ProcessOptions::DEFAULT,
            scratch: StereoBuffer::zeroed(SCRATCH_FRAMES)?,
        };
        compositor.update_delays(0)?;
        Ok(compositor)
    }

    pub fn convolver(&self) -> &dyn Convolver {
        self.convolver.as_ref()
    }

    /// Loads a stereo impulse response into the engine.
    ///
    /// A background worker is suspended around the load and resumed
    /// afterwards, and the dry path is re-aligned with the new latency.
    pub fn load_impulse(&mut self, left: &[Sample], right: &[Sample]) -> Result<()> {
        self.convolver.suspend()?;
        let loaded = self.convolver.load(left, right);
        let aligned = self.update_delays(self.initial_delay);
        self.convolver.resume()?;
        loaded?;
        aligned
    }

    pub fn unload_impulse(&mut self) -> Result<()> {
        self.convolver.suspend()?;
        let unloaded = self.convolver.unload();
        self.convolver.resume()?;
        unloaded
    }

    /// Changes the engine's fragment size (and two-tier factor), keeping the
    /// loaded response.
    pub fn set_fragment_size(&mut self, fragment_size: usize, factor: usize) -> Result<()> {
        self.convolver.suspend()?;
        let resized = self.convolver.set_fragment_size(fragment_size, factor);
        let aligned = self.update_delays(self.initial_delay);
        self.convolver.resume()?;
        resized?;
        aligned
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.convolver.suspend()
    }

    pub fn resume(&mut self) -> Result<()> {
        self.convolver.resume()
    }

    /// See [`Convolver::set_offline`].
    pub fn set_offline(&mut self, offline: bool) {
        self.convolver.set_offline(offline);
    }

    pub fn latency(&self) -> usize {
        self.convolver.latency()
    }

    pub fn impulse_size(&self) -> usize {
        self.convolver.impulse_size()
    }

    pub fn fragment_size(&self) -> usize {
        self.convolver.fragment_size()
    }

    pub fn wet(&self) -> Sample {
        self.wet_db
    }

    pub fn set_wet(&mut self, db: Sample) {
        self.wet_db = db;
        self.wet = db_to_ratio(db);
        self.update_mix();
    }

    pub fn wet_ratio(&self) -> Sample {
        self.wet
    }

    pub fn set_wet_ratio(&mut self, ratio: Sample) {
        self.wet = ratio;
        self.wet_db = ratio_to_db(ratio);
        self.update_mix();
    }

    pub fn dry(&self) -> Sample {
        self.dry_db
    }

    pub fn set_dry(&mut self, db: Sample) {
        self.dry_db = db;
        self.dry = db_to_ratio(db);
    }

    pub fn dry_ratio(&self) -> Sample {
        self.dry
    }

    pub fn set_dry_ratio(&mut self, ratio: Sample) {
        self.dry = ratio;
        self.dry_db = ratio_to_db(ratio);
    }

    pub fn width(&self) -> Sample {
        self.width
    }

    /// `1` keeps the stereo image, `0` folds the wet signal to mono.
    pub fn set_width(&mut self, width: Sample) {
        self.width = width;
        self.update_mix();
    }

    pub fn lr_balance(&self) -> Sample {
        self.lr_balance
    }

    /// `-1` keeps only the left wet channel, `1` only the right one.
    pub fn set_lr_balance(&mut self, balance: Sample) {
        self.lr_balance = balance.clamp(-1.0, 1.0);
        self.update_mix();
    }

    pub fn lpf(&self) -> Sample {
        self.filter.lpf()
    }

    pub fn set_lpf(&mut self, cutoff: Sample) {
        self.filter.set_lpf(cutoff);
    }

    pub fn hpf(&self) -> Sample {
        self.filter.hpf()
    }

    pub fn set_hpf(&mut self, cutoff: Sample) {
        self.filter.set_hpf(cutoff);
    }

    pub fn sample_rate(&self) -> Sample {
        self.filter.sample_rate()
    }

    pub fn set_sample_rate(&mut self, sample_rate: Sample) {
        self.filter.set_sample_rate(sample_rate);
    }

    pub fn initial_delay(&self) -> i64 {
        self.initial_delay
    }

    /// Delays the wet path by `samples`, or the dry path when negative.
    ///
    /// On error the previous delay stays in effect.
    pub fn set_initial_delay(&mut self, samples: i64) -> Result<()> {
        self.update_delays(samples)
    }

    pub fn process_options(&self) -> ProcessOptions {
        self.options
    }

    /// Options used by [`process`](Self::process).
    pub fn set_process_options(&mut self, options: ProcessOptions) {
        self.options = options;
    }

    /// Clears the engine history, both delay paths and the filter state.
    pub fn mute(&mut self) -> Result<()> {
        self.convolver.mute()?;
        for line in self.dry_delay.iter_mut().chain(self.wet_delay.iter_mut()) {
            line.mute();
        }
        self.filter.mute();
        Ok(())
    }

    fn update_mix(&mut self) {
        self.mix = WetMix::new(self.wet, self.width, self.lr_balance);
    }

    /// Rebuilds all four delay lines; nothing changes unless every line
    /// could be allocated.
    fn update_delays(&mut self, initial_delay: i64) -> Result<()> {
        let latency = self.convolver.latency();
        let (dry, wet) = delay_lengths(latency, initial_delay)?;
        let dry_delay = [DelayLine::new(dry)?, DelayLine::new(dry)?];
        let wet_delay = [DelayLine::new(wet)?, DelayLine::new(wet)?];

        self.dry_delay = dry_delay;
        self.wet_delay = wet_delay;
        self.initial_delay = initial_delay;
        debug!(latency, dry, wet, "aligned dry and wet paths");
        Ok(())
    }

    /// Processes with the stored options.
    pub fn process(
        &mut self,
        in_l: &[Sample],
        in_r: &[Sample],
        out_l: &mut [Sample],
        out_r: &mut [Sample],
    ) -> Result<()> {
        let options = self.options;
        self.process_with(in_l, in_r, out_l, out_r, options)
    }

    /// Processes with one-off `options`; the stored options are untouched.
    pub fn process_with(
        &mut self,
        in_l: &[Sample],
        in_r: &[Sample],
        out_l: &mut [Sample],
        out_r: &mut [Sample],
        options: ProcessOptions,
    ) -> Result<()> {
        let n = frame_count(in_l, in_r, out_l, out_r)?;

        let mut offset = 0;
        while offset < n {
            let len = (n - offset).min(SCRATCH_FRAMES);
            let range = offset..offset + len;
            let (dry_l, dry_r) = (&in_l[range.clone()], &in_r[range.clone()]);
            let wet_l = &mut self.scratch.left[..len];
            let wet_r = &mut self.scratch.right[..len];

            self.convolver.process(dry_l, dry_r, wet_l, wet_r)?;
            if !options.contains(ProcessOptions::SKIP_FILTER) {
                self.filter.process(wet_l, wet_r);
            }
            self.wet_delay[0].process_block(wet_l);
            self.wet_delay[1].process_block(wet_r);

            let (mut o_l, mut o_r) = (&mut out_l[range.clone()], &mut out_r[range]);
            if options.contains(ProcessOptions::SWAP_LR) {
                std::mem::swap(&mut o_l, &mut o_r);
            }
            if !options.contains(ProcessOptions::SKIP_INIT) {
                o_l.fill(0.0);
                o_r.fill(0.0);
            }

            if !options.contains(ProcessOptions::MUTE_WET) {
                let mix = self.mix;
                for i in 0..len {
                    o_l[i] += wet_l[i] * mix.direct_l + wet_r[i] * mix.cross_l;
                    o_r[i] += wet_r[i] * mix.direct_r + wet_l[i] * mix.cross_r;
                }
            }

            let mute_dry = options.contains(ProcessOptions::MUTE_DRY);
            let [delay_l, delay_r] = &mut self.dry_delay;
            for i in 0..len {
                let (l, r) = (delay_l.process(dry_l[i]), delay_r.process(dry_r[i]));
                if !mute_dry {
                    o_l[i] += l * self.dry;
                    o_r[i] += r * self.dry;
                }
            }

            offset += len;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("kind", &self.convolver.kind())
            .field("wet_db", &self.wet_db)
            .field("dry_db", &self.dry_db)
            .field("width", &self.width)
            .field("lr_balance", &self.lr_balance)
            .field("initial_delay", &self.initial_delay)
            .field("options", &self.options)
            .finish()
    }
}
