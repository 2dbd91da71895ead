use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use clap::{Parser, Subcommand};
use impulser_core::{
    ConvolverKind, EngineConfig, ImpulseResponse, ImpulserError, ProcessOptions,
    Sample,
};
use tracing_subscriber::EnvFilter;

fn main() -> impulser_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    cli.engine.apply(&mut config);
    // Every command renders faster than real time.
    config.offline = true;

    match cli.command {
        Commands::Bench {
            all,
            impulse_length,
            process_frames,
            frame_count,
        } => {
            let models: Vec<ConvolverKind> = if all {
                ConvolverKind::ALL
                    .into_iter()
                    .filter(|kind| kind.suits_long_responses())
                    .collect()
            } else {
                vec![config.model]
            };
            for model in models {
                let config = EngineConfig {
                    model,
                    ..config.clone()
                };
                run_bench(&config, impulse_length, process_frames, frame_count)?;
            }
            Ok(())
        }
        Commands::Verify {
            impulse_length,
            tolerance,
        } => run_verify(&config, impulse_length, tolerance),
        Commands::Render {
            impulse,
            impulse_channels,
            input,
            output,
            block,
        } => run_render(&config, &impulse, impulse_channels, &input, &output, block),
    }
}

fn run_bench(
    config: &EngineConfig,
    impulse_length: usize,
    process_frames: usize,
    frame_count: usize,
) -> impulser_core::Result<()> {
    tracing::info!(model = %config.model, impulse_length, "running benchmark");

    let mut compositor = config.build()?;
    let silence = vec![0.0; impulse_length];
    let started = Instant::now();
    compositor.load_impulse(&silence, &silence)?;
    let load_time = started.elapsed();

    let input = vec![0.0; process_frames];
    let mut out_l = vec![0.0; process_frames];
    let mut out_r = vec![0.0; process_frames];
    let started = Instant::now();
    for _ in 0..frame_count {
        compositor.process(&input, &input, &mut out_l, &mut out_r)?;
    }
    let process_time = started.elapsed().as_secs_f64();

    let audio_seconds = (process_frames * frame_count) as f64 / f64::from(config.sample_rate);
    println!(
        "{:<18} load {:>8.3} s  process {:>8.3} s  realtime x{:.1}  latency {}",
        config.model.as_str(),
        load_time.as_secs_f64(),
        process_time,
        audio_seconds / process_time.max(f64::EPSILON),
        compositor.latency(),
    );
    Ok(())
}

/// Convolves unit impulses with a ramp response and reports the largest
/// deviation from the exact result.
fn run_verify(
    config: &EngineConfig,
    impulse_length: usize,
    tolerance: f64,
) -> impulser_core::Result<()> {
    let ramp: Vec<Sample> = (1..=impulse_length).map(|i| i as Sample).collect();
    let mut compositor = config.build()?;
    compositor.set_wet_ratio(1.0);
    compositor.set_dry_ratio(0.0);
    compositor.load_impulse(&ramp, &ramp)?;

    let latency = compositor.latency();
    let frames = latency + 2 * impulse_length;
    let mut in_l = vec![0.0; frames];
    let mut in_r = vec![0.0; frames];
    in_l[0] = 1.0;
    in_r[1] = 1.0;
    let mut out_l = vec![0.0; frames];
    let mut out_r = vec![0.0; frames];
    compositor.process_with(
        &in_l,
        &in_r,
        &mut out_l,
        &mut out_r,
        ProcessOptions::MUTE_DRY | ProcessOptions::SKIP_FILTER,
    )?;

    let mut max_error: Sample = 0.0;
    for i in 0..impulse_length {
        max_error = max_error.max((out_l[latency + i] - (i + 1) as Sample).abs());
        max_error = max_error.max((out_r[latency + i] - i as Sample).abs());
    }
    let relative = max_error as f64 / impulse_length as f64;
    println!(
        "{}: latency {latency}, max error {max_error:.15} (relative {relative:.3e})",
        config.model.as_str()
    );

    if relative > tolerance {
        return Err(ImpulserError::msg(format!(
            "relative error {relative:.3e} exceeds {tolerance:.3e}"
        )));
    }
    Ok(())
}

fn run_render(
    config: &EngineConfig,
    impulse: &Path,
    impulse_channels: usize,
    input: &Path,
    output: &Path,
    block: usize,
) -> impulser_core::Result<()> {
    if block == 0 {
        return Err(ImpulserError::msg("block size must be positive"));
    }
    tracing::info!(?impulse, ?input, ?output, "rendering");

    let response = ImpulseResponse::from_interleaved(&read_f32(impulse)?, impulse_channels)?;
    let source = ImpulseResponse::from_interleaved(&read_f32(input)?, 2)?;

    let mut compositor = config.build()?;
    compositor.load_impulse(response.left(), response.right())?;
    tracing::info!(
        impulse_size = compositor.impulse_size(),
        latency = compositor.latency(),
        "impulse response loaded"
    );

    let frames = source.len() + compositor.latency() + response.len();
    let mut writer = BufWriter::new(File::create(output)?);
    let mut in_l = vec![0.0; block];
    let mut in_r = vec![0.0; block];
    let mut out_l = vec![0.0; block];
    let mut out_r = vec![0.0; block];

    let mut offset = 0;
    while offset < frames {
        let len = block.min(frames - offset);
        for i in 0..len {
            in_l[i] = source.left().get(offset + i).copied().unwrap_or(0.0);
            in_r[i] = source.right().get(offset + i).copied().unwrap_or(0.0);
        }
        compositor.process(&in_l[..len], &in_r[..len], &mut out_l[..len], &mut out_r[..len])?;
        for (l, r) in out_l[..len].iter().zip(&out_r[..len]) {
            writer.write_all(&(*l as f32).to_le_bytes())?;
            writer.write_all(&(*r as f32).to_le_bytes())?;
        }
        offset += len;
    }
    writer.flush()?;
    tracing::info!(frames, "render finished");
    Ok(())
}

/// Reads raw little-endian 32-bit float samples.
fn read_f32(path: &Path) -> impulser_core::Result<Vec<Sample>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(ImpulserError::msg(format!(
            "{} is not raw 32-bit float audio",
            path.display()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as Sample)
        .collect())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Partitioned convolution engine", long_about = None)]
struct Cli {
    /// JSON engine configuration; command line options override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct EngineArgs {
    /// Convolution engine: single-tier, zero-latency, two-tier, two-tier-threaded,
    /// single-block or direct.
    #[arg(short, long, global = true)]
    model: Option<ConvolverKind>,

    /// Fragment size in samples (rounded up to a power of two).
    #[arg(long, global = true)]
    fragment_size: Option<usize>,

    /// Large block factor of the two-tier engines.
    #[arg(long, global = true)]
    factor: Option<usize>,

    /// Wet gain in dB.
    #[arg(long, global = true, allow_negative_numbers = true)]
    wet: Option<Sample>,

    /// Dry gain in dB.
    #[arg(long, global = true, allow_negative_numbers = true)]
    dry: Option<Sample>,
}

impl EngineArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(fragment_size) = self.fragment_size {
            config.fragment_size = fragment_size;
        }
        if let Some(factor) = self.factor {
            config.factor = factor;
        }
        if let Some(wet) = self.wet {
            config.wet_db = wet;
        }
        if let Some(dry) = self.dry {
            config.dry_db = dry;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure load time and real-time factor on a silent impulse response.
    Bench {
        /// Benchmark every engine except the direct one instead of the configured one.
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 480_000)]
        impulse_length: usize,
        /// Frames per process call.
        #[arg(long, default_value_t = 1024)]
        process_frames: usize,
        /// Number of process calls.
        #[arg(long, default_value_t = 1000)]
        frame_count: usize,
    },
    /// Check the engine against an exact ramp convolution.
    Verify {
        #[arg(long, default_value_t = 2048)]
        impulse_length: usize,
        /// Largest accepted error relative to the response length.
        #[arg(long, default_value_t = 1e-6)]
        tolerance: f64,
    },
    /// Convolve raw little-endian f32 stereo audio with a raw f32 response.
    Render {
        /// Raw f32 impulse response.
        impulse: PathBuf,
        /// Raw interleaved f32 stereo input.
        input: PathBuf,
        /// Destination for raw interleaved f32 stereo output.
        output: PathBuf,
        /// Interleaved channels in the impulse response file.
        #[arg(long, default_value_t = 2)]
        impulse_channels: usize,
        /// Frames per process call.
        #[arg(long, default_value_t = 1024)]
        block: usize,
    },
}
