//! Benchmarks for graph compilation and full executions
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pcg_dispatch::executor::{ComputeGraphExecutor, ExecutionRequest, ExecutorServices, TaskMode};
use pcg_dispatch::gpu::{KernelIo, RenderQueue, SimulatedScheduler};
use pcg_dispatch::graph::{
    GraphDeclaration, KernelDecl, KernelGraphCompiler, PinSizing, PinSpec, StaticGraphCompiler,
};
use pcg_dispatch::types::{BufferData, DataCollection, ExportMode, GridSize, PcgData};
use std::sync::Arc;

fn scatter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let points: Vec<f32> = io
        .input_f32s("Seeds")?
        .iter()
        .flat_map(|s| [*s, s + 0.25, s + 0.5, s + 0.75])
        .collect();
    io.write_f32s("Points", &points)?;
    Ok(())
}

fn filter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let kept: Vec<f32> = io
        .input_f32s("Points")?
        .into_iter()
        .filter(|p| p.fract() < 0.5)
        .collect();
    let written = io.write_f32s("Filtered", &kept)?;
    io.set_counter("Filtered", written)
}

fn forest(export: ExportMode) -> GraphDeclaration {
    GraphDeclaration::new("forest")
        .pin(PinSpec::input_buffer("Seeds", 4))
        .pin(PinSpec::intermediate_buffer(
            "Points",
            4,
            PinSizing::FromInput {
                pin: "Seeds".into(),
                multiplier: 4,
            },
        ))
        .pin(
            PinSpec::output_buffer(
                "Filtered",
                4,
                PinSizing::FromInput {
                    pin: "Points".into(),
                    multiplier: 1,
                },
            )
            .with_export(export)
            .counted(),
        )
        .kernel(KernelDecl::new("scatter", scatter).reads("Seeds").writes("Points"))
        .kernel(KernelDecl::new("filter", filter).reads("Points").writes("Filtered"))
}

/// A chain of `len` pass-through kernels between one input and one output
fn chain(len: usize) -> GraphDeclaration {
    fn pass(_io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
        Ok(())
    }

    let sizing = |pin: &str| PinSizing::FromInput {
        pin: pin.into(),
        multiplier: 1,
    };
    let mut decl = GraphDeclaration::new("chain").pin(PinSpec::input_buffer("p0", 4));
    for i in 1..len {
        decl = decl.pin(PinSpec::intermediate_buffer(format!("p{}", i), 4, sizing(&format!("p{}", i - 1))));
    }
    decl = decl.pin(PinSpec::output_buffer(format!("p{}", len), 4, sizing(&format!("p{}", len - 1))));
    for i in 0..len {
        decl = decl.kernel(
            KernelDecl::new(format!("k{}", i), pass)
                .reads(format!("p{}", i).as_str())
                .writes(format!("p{}", i + 1).as_str()),
        );
    }
    decl
}

fn services(decl: &GraphDeclaration) -> ExecutorServices {
    let compiler = Arc::new(StaticGraphCompiler::new());
    compiler
        .register(decl, GridSize::Cells(400), 0)
        .expect("benchmark graph compiles");
    let render = RenderQueue::inline();
    ExecutorServices::new(compiler, Arc::new(SimulatedScheduler::new(render.clone())), render)
        .with_task_mode(TaskMode::Inline)
}

fn seeds(count: usize) -> DataCollection {
    let values: Vec<f32> = (0..count).map(|i| i as f32 * 0.1).collect();
    DataCollection::new().with("Seeds", PcgData::Buffer(BufferData::from_f32s(1, vec![], &values)))
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for len in [4, 32, 256].iter() {
        let decl = chain(*len);
        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("chain", len), &decl, |b, decl| {
            b.iter(|| black_box(KernelGraphCompiler::compile(decl, GridSize::Cells(400), 0)));
        });
    }

    group.finish();
}

fn bench_inline_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_execution");

    for (label, export) in [("readback", ExportMode::NoExport), ("export", ExportMode::ComputeGraphOutput)] {
        let services = services(&forest(export));
        for count in [64, 1024, 16_384].iter() {
            let inputs = seeds(*count);
            group.throughput(Throughput::Elements(*count as u64));
            group.bench_with_input(BenchmarkId::new(label, count), &inputs, |b, inputs| {
                b.iter(|| {
                    let request = ExecutionRequest::new("forest", 300.0).with_inputs(inputs.clone());
                    let mut executor = ComputeGraphExecutor::new(services.clone(), request);
                    black_box(executor.tick())
                });
            });
        }
        // Exported outputs accumulate until released
        if let Ok(mut exported) = services.exported.lock() {
            *exported = Default::default();
        };
    }

    group.finish();
}

fn bench_grid_selection(c: &mut Criterion) {
    let grids = [400, 800, 1600, 3200, 6400, 12800];
    c.bench_function("grid_for_extent", |b| {
        let mut extent = 0.0;
        b.iter(|| {
            extent = (extent + 137.0) % 20_000.0;
            black_box(GridSize::for_extent(black_box(extent), &grids))
        });
    });
}

criterion_group!(benches, bench_compile, bench_inline_execution, bench_grid_selection);
criterion_main!(benches);
