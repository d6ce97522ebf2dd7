use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use entrain_core::{
    AppConfig, AudioEngine, FsLoader, ManualClock, ManualFrames, PatternRegistry, PixelSurface,
    RenderContext, RenderLoop, SoundCatalog, StimulusAnalyzer, Surface,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn main() -> entrain_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            seconds,
            jitter_ms,
            width,
            height,
            acknowledge_safety,
        } => run_simulate(
            config.as_deref(),
            seconds,
            jitter_ms,
            (width, height),
            acknowledge_safety,
        ),
        Commands::Snapshot {
            config,
            output,
            time,
            on,
            width,
            height,
        } => run_snapshot(config.as_deref(), &output, time, on, (width, height)),
        Commands::Session {
            config,
            assets,
            manifest,
            seconds,
            wav,
            seed,
            no_preload,
        } => {
            let loader = FsLoader::new(assets).with_manifest(manifest);
            run_session(config.as_deref(), loader, seconds, &wav, seed, !no_preload)
        }
    }
}

fn load_config(path: Option<&Path>) -> entrain_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn check_size(width: u32, height: u32) -> entrain_core::Result<()> {
    if width == 0 || height == 0 {
        return Err(entrain_core::EntrainError::InvalidInput(
            "surface width and height must be non-zero",
        ));
    }
    Ok(())
}

fn run_simulate(
    config_path: Option<&Path>,
    seconds: f64,
    jitter_ms: f64,
    (width, height): (u32, u32),
    acknowledge_safety: bool,
) -> entrain_core::Result<()> {
    check_size(width, height)?;
    let mut config = load_config(config_path)?;
    if acknowledge_safety {
        config.visual.safety_acknowledged = true;
    }
    if !config.visual.safety_acknowledged {
        return Err(entrain_core::EntrainError::msg(
            "photosensitivity notice not acknowledged; pass --acknowledge-safety",
        ));
    }

    let refresh = config.visual.refresh_rate_hz;
    let target = config.visual.effective_target_hz();
    tracing::info!(refresh, target, seconds, jitter_ms, "simulating render loop");

    let clock = ManualClock::new();
    let mut render_loop: RenderLoop<PixelSurface, AppConfig, ManualFrames> =
        RenderLoop::new(Arc::new(clock.clone()), ManualFrames::new());
    render_loop.start(PixelSurface::new(width, height), config);

    let mut rng = SmallRng::seed_from_u64(0x51a7);
    let mut analyzer = StimulusAnalyzer::new(refresh);
    let period_ms = 1000.0 / refresh;
    let vsyncs = (seconds * refresh).round() as usize;
    let mut now_ms = 0.0;

    for _ in 0..vsyncs {
        let jitter = if jitter_ms > 0.0 {
            rng.random_range(-jitter_ms..=jitter_ms)
        } else {
            0.0
        };
        now_ms += (period_ms + jitter).max(0.0);
        clock.set(Duration::from_secs_f64(now_ms / 1000.0));
        if let Some(handle) = render_loop.frames_mut().take_pending() {
            render_loop.on_frame(handle);
        }
        if let Some(surface) = render_loop.surface() {
            analyzer.push((surface.mean_luminance() * surface.opacity()) as f32);
        }
    }

    let diagnostics = render_loop.diagnostics();
    let report = analyzer.report()?;
    println!(
        "fps={:.2} avg_frame_ms={:.3} p95_frame_ms={:.3} dropped={} repaints={} cache_hits={}",
        diagnostics.fps,
        diagnostics.avg_frame_time_ms,
        diagnostics.p95_frame_time_ms,
        diagnostics.dropped_frame_count,
        diagnostics.repaints,
        diagnostics.cache_hits,
    );
    match report.dominant_hz {
        Some(hz) => println!(
            "measured_hz={hz:.3} target_hz={target:.3} duty={:.3} depth={:.3}",
            report.duty_cycle, report.modulation_depth
        ),
        None => println!("measured_hz=none target_hz={target:.3}"),
    }
    render_loop.stop();
    Ok(())
}

fn run_snapshot(
    config_path: Option<&Path>,
    output: &Path,
    time: f64,
    on: bool,
    (width, height): (u32, u32),
) -> entrain_core::Result<()> {
    check_size(width, height)?;
    let config = load_config(config_path)?;
    let visual = &config.visual;
    let registry = PatternRegistry::new();
    let mut surface = PixelSurface::new(width, height);

    {
        let mut ctx = RenderContext {
            surface: &mut surface,
            width: width as f64,
            height: height as f64,
            is_on: on,
            time,
            params: &visual.pattern,
            colors: &visual.colors,
            neurofeedback: None,
        };
        registry.render(visual.pattern_mode, &visual.pattern_id, &mut ctx);
    }
    surface.set_opacity(visual.colors.brightness);

    let file = File::create(output)?;
    surface.write_ppm(BufWriter::new(file))?;
    tracing::info!(?output, pattern = %visual.pattern_id, on, time, "snapshot written");
    Ok(())
}

fn run_session(
    config_path: Option<&Path>,
    loader: FsLoader,
    seconds: f64,
    wav: &Path,
    seed: Option<u64>,
    preload: bool,
) -> entrain_core::Result<()> {
    let config = load_config(config_path)?;
    let sample_rate = config.audio.sample_rate;
    let block_size = config.audio.block_size.max(1);
    let tick_frames = ((config.audio.tick_interval_ms * sample_rate as f64 / 1000.0).round() as usize).max(1);
    let tail_seconds = config.audio.binaural.ramp_seconds + 2.0;

    let loader = Arc::new(loader);
    let catalog = Arc::new(match seed {
        Some(seed) => SoundCatalog::with_seed(loader, seed),
        None => SoundCatalog::new(loader),
    });
    if let Err(err) = catalog.load_manifest() {
        tracing::warn!(%err, "continuing without sound events");
    }

    let engine = match seed {
        Some(seed) => AudioEngine::with_seed(config, catalog, seed),
        None => AudioEngine::new(config, catalog),
    };
    if preload {
        let loaded = engine.preload()?;
        tracing::info!(loaded, "buffers preloaded");
    }

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(wav, spec)?;
    let mut left = vec![0.0_f32; block_size];
    let mut right = vec![0.0_f32; block_size];

    let mut write_frames = |engine: &AudioEngine<AppConfig>, frames: usize| -> entrain_core::Result<()> {
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(block_size);
            engine.render(&mut left[..n], &mut right[..n])?;
            for (l, r) in left[..n].iter().zip(&right[..n]) {
                writer.write_sample(to_i16(*l))?;
                writer.write_sample(to_i16(*r))?;
            }
            remaining -= n;
        }
        Ok(())
    };

    engine.start()?;
    let session_frames = (seconds * sample_rate as f64).round() as usize;
    let mut rendered = 0;
    while rendered < session_frames {
        engine.tick()?;
        let n = tick_frames.min(session_frames - rendered);
        write_frames(&engine, n)?;
        rendered += n;
    }
    engine.stop()?;
    write_frames(&engine, (tail_seconds * sample_rate as f64).round() as usize)?;
    drop(write_frames);

    writer.finalize()?;
    engine.wait_for_loads()?;

    let diagnostics = engine.diagnostics()?;
    println!(
        "events_fired={} uncached={} starved={} capped={} completed={} active={} cached={}/{} cache_bytes={}",
        diagnostics.events_fired,
        diagnostics.events_uncached,
        diagnostics.events_starved,
        diagnostics.events_capped,
        diagnostics.chains_completed,
        diagnostics.active_sound_count,
        diagnostics.cache_stats.cached,
        diagnostics.cache_stats.total,
        diagnostics.cache_stats.size_estimate_bytes,
    );
    tracing::info!(?wav, seconds, "session written");
    Ok(())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Flicker and ambient-audio entrainment engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the render loop headlessly against a simulated display.
    Simulate {
        /// JSON configuration file; defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f64,
        /// Uniform vsync jitter in milliseconds.
        #[arg(long, default_value_t = 0.0)]
        jitter_ms: f64,
        #[arg(long, default_value_t = 160)]
        width: u32,
        #[arg(long, default_value_t = 90)]
        height: u32,
        /// Accept the photosensitivity notice for this run.
        #[arg(long)]
        acknowledge_safety: bool,
    },
    /// Render one frame of the configured pattern to a PPM image.
    Snapshot {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Seconds since loop start, for animated patterns.
        #[arg(long, default_value_t = 0.0)]
        time: f64,
        /// Paint the "on" half-cycle.
        #[arg(long)]
        on: bool,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 360)]
        height: u32,
    },
    /// Render an ambient audio session offline to a stereo WAV file.
    Session {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory holding the manifest and the sound files.
        #[arg(short, long)]
        assets: PathBuf,
        /// Manifest file name inside the assets directory.
        #[arg(long, default_value = "manifest.json")]
        manifest: String,
        #[arg(short, long, default_value_t = 60.0)]
        seconds: f64,
        #[arg(short, long)]
        wav: PathBuf,
        /// Seed for reproducible scheduling.
        #[arg(long)]
        seed: Option<u64>,
        /// Load buffers on demand instead of up front.
        #[arg(long)]
        no_preload: bool,
    },
}
