//! pcg-dispatch demo runner
//!
//! Scatters points around a set of seeds, filters them, splats the
//! survivors into a density texture and drives the execution tick by tick
//! against the simulated render backend.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use pcg_dispatch::{
    config::OrchestratorConfig,
    debug::{LogVisualizer, MemoryInspectionStore},
    executor::{ComputeGraphExecutor, ExecutionRequest, ExecutorServices, PhaseResult, TaskMode},
    gpu::{KernelIo, RenderQueue, SimulatedScheduler},
    graph::{GraphDeclaration, KernelDecl, PinSizing, PinSpec, StaticGraphCompiler},
    types::{BufferData, DataCollection, ExportMode, GridSize, PcgData, TextureFormat},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// World-space edge length the density texture covers
const WORLD_SIZE: f32 = 400.0;

#[derive(Debug, Parser)]
#[command(name = "pcg-dispatch", version, about = "Run a procedural compute graph against the simulated backend")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up after this many ticks
    #[arg(long, default_value_t = 64)]
    ticks: u64,

    /// Run render work on a dedicated thread
    #[arg(long)]
    threaded: bool,

    /// Write inspection snapshots to this JSON file
    #[arg(long)]
    dump_inspection: Option<PathBuf>,

    /// Also log to daily-rolling files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Extent of the generation volume
    #[arg(long, default_value_t = 350.0)]
    extent: f64,

    /// Number of scatter seeds
    #[arg(long, default_value_t = 256)]
    seeds: u32,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pcg_dispatch=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pcg-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

// ── Demo graph ──

/// Deterministic offset in [-4, 4) for the n-th scattered point
fn jitter(n: u32) -> (f32, f32) {
    let h = n.wrapping_mul(2_654_435_761);
    let unit = |bits: u32| (bits & 0xffff) as f32 / 65_536.0;
    (unit(h) * 8.0 - 4.0, unit(h >> 16) * 8.0 - 4.0)
}

fn scatter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let seeds = io.input_f32s("Seeds")?;
    let mut points = Vec::with_capacity(seeds.len() * 4);
    for (i, seed) in seeds.chunks_exact(2).enumerate() {
        for k in 0..4 {
            let (dx, dy) = jitter(i as u32 * 4 + k);
            points.extend([seed[0] + dx, seed[1] + dy]);
        }
    }
    io.write_f32s("Points", &points)?;
    Ok(())
}

fn filter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let kept: Vec<f32> = io
        .input_f32s("Points")?
        .chunks_exact(2)
        .filter(|p| (p[0] * 0.05).sin() * (p[1] * 0.05).cos() > -0.2)
        .flatten()
        .copied()
        .collect();
    let written = io.write_f32s("Filtered", &kept)?;
    io.set_counter("Filtered", written)
}

fn splat(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let points = io.input_f32s("Filtered")?;
    let (width, height) = io.output_extent("Density")?;
    let mut density = vec![0.0f32; (width * height) as usize];
    for p in points.chunks_exact(2) {
        let x = ((p[0] / WORLD_SIZE) * width as f32).clamp(0.0, (width - 1) as f32) as u32;
        let y = ((p[1] / WORLD_SIZE) * height as f32).clamp(0.0, (height - 1) as f32) as u32;
        density[(y * width + x) as usize] += 1.0;
    }
    io.write_f32s("Density", &density)?;
    Ok(())
}

fn scatter_graph() -> GraphDeclaration {
    GraphDeclaration::new("scatter")
        .pin(PinSpec::input_buffer("Seeds", 8).with_attributes(["x", "y"]))
        .pin(PinSpec::intermediate_buffer(
            "Points",
            8,
            PinSizing::FromInput { pin: "Seeds".into(), multiplier: 4 },
        ))
        .pin(
            PinSpec::output_buffer("Filtered", 8, PinSizing::FromInput { pin: "Points".into(), multiplier: 1 })
                .with_attributes(["x", "y"])
                .with_export(ExportMode::ComputeGraphOutput)
                .counted(),
        )
        .pin(PinSpec::output_texture("Density", TextureFormat::R32F, 64, 64))
        .kernel(KernelDecl::new("scatter", scatter).reads("Seeds").writes("Points"))
        .kernel(KernelDecl::new("filter", filter).reads("Points").writes("Filtered"))
        .kernel(KernelDecl::new("splat", splat).reads("Filtered").writes("Density"))
}

fn seeds(count: u32) -> DataCollection {
    let values: Vec<f32> = (0..count)
        .flat_map(|i| {
            let (dx, dy) = jitter(i.wrapping_add(7919));
            [(i % 16) as f32 * 25.0 + 12.5 + dx, (i / 16 % 16) as f32 * 25.0 + 12.5 + dy]
        })
        .collect();
    DataCollection::new().with(
        "Seeds",
        PcgData::Buffer(BufferData::from_f32s(2, vec!["x".into(), "y".into()], &values)),
    )
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_deref());

    tracing::info!("Starting pcg-dispatch demo");

    let config = OrchestratorConfig::load_or_default(args.config.as_deref());
    config.validate().context("invalid configuration")?;

    let compiler = Arc::new(StaticGraphCompiler::new());
    let grids = config
        .grid_sizes
        .iter()
        .map(|&size| GridSize::Cells(size))
        .chain([GridSize::Unbounded]);
    compiler
        .register_for_grids(&scatter_graph(), grids, 0)
        .context("failed to compile the demo graph")?;

    let (render, task_mode) = if args.threaded {
        (RenderQueue::threaded(), TaskMode::Threaded)
    } else {
        (RenderQueue::deferred(), TaskMode::Inline)
    };
    let store = Arc::new(MemoryInspectionStore::new(config.debug.max_snapshots));
    let services = ExecutorServices::from_config(
        &config,
        compiler,
        Arc::new(SimulatedScheduler::new(render.clone())),
        render.clone(),
    )
    .with_inspection(store.clone())
    .with_visualizer(Arc::new(LogVisualizer::new()))
    .with_task_mode(task_mode);

    let request = ExecutionRequest::new("scatter", args.extent)
        .with_inputs(seeds(args.seeds))
        .with_debug(config.debug.visualize)
        .with_inspect(config.debug.inspect || args.dump_inspection.is_some())
        .with_producer("demo-tile");
    let mut executor = ComputeGraphExecutor::new(services, request);

    let mut output = None;
    for _ in 0..args.ticks {
        match executor.tick() {
            PhaseResult::Suspended => {
                if render.pump() == 0 && args.threaded {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            PhaseResult::Done(collection) => {
                output = Some(collection);
                break;
            }
            PhaseResult::Failed(failure) => bail!("{}", failure),
        }
    }

    let Some(output) = output else {
        executor.cancel();
        return Err(anyhow!("execution did not finish within {} ticks", args.ticks));
    };

    for tagged in &output.tagged {
        tracing::info!(
            "{}: {} element(s){}",
            tagged.pin,
            tagged.data.element_count(),
            if tagged.data.is_gpu_resident() { " (exported)" } else { "" }
        );
    }
    println!("{}", serde_json::to_string_pretty(executor.stats())?);

    if let Some(path) = &args.dump_inspection {
        store.dump_json(path)?;
    }

    Ok(())
}
