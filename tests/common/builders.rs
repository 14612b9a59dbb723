//! Test data builders for graphs, inputs and backends

use pcg_dispatch::executor::{ExecutionRequest, ExecutorServices, TaskMode};
use pcg_dispatch::gpu::{
    GpuResource, KernelIo, RenderQueue, ResourceDesc, SharedExportedArena, SimulatedScheduler,
};
use pcg_dispatch::graph::{
    CompiledKernelGraph, GraphDeclaration, KernelDecl, PinSizing, PinSpec, StaticGraphCompiler,
};
use pcg_dispatch::readback::Generation;
use pcg_dispatch::types::{
    BufferData, DataCollection, DataKind, ExportMode, GpuResidentData, GridSize, PcgData,
    TextureFormat,
};
use std::sync::Arc;

pub const GRAPH: &str = "forest";
pub const GRID: GridSize = GridSize::Cells(400);
pub const EXTENT: f64 = 300.0;

fn scatter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let points: Vec<f32> = io
        .input_f32s("Seeds")?
        .iter()
        .flat_map(|s| [*s, s + 0.5])
        .collect();
    io.write_f32s("Points", &points)?;
    Ok(())
}

fn filter(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let kept: Vec<f32> = io
        .input_f32s("Points")?
        .into_iter()
        .filter(|p| *p >= 2.0)
        .collect();
    let written = io.write_f32s("Filtered", &kept)?;
    io.set_counter("Filtered", written)
}

fn splat(io: &mut KernelIo<'_>) -> pcg_dispatch::Result<()> {
    let points = io.input_f32s("Filtered")?;
    let (width, height) = io.output_extent("Density")?;
    let mut texels = vec![0.0f32; (width * height) as usize];
    for p in points {
        let idx = (p.max(0.0) as usize).min(texels.len() - 1);
        texels[idx] += 1.0;
    }
    io.write_f32s("Density", &texels)?;
    Ok(())
}

/// Builder for the scatter → filter test graph
pub struct ForestGraphBuilder {
    export: bool,
    texture: bool,
    name: String,
}

impl ForestGraphBuilder {
    pub fn new() -> Self {
        Self {
            export: false,
            texture: false,
            name: GRAPH.to_string(),
        }
    }

    /// Export "Filtered" instead of reading it back
    pub fn exported(mut self) -> Self {
        self.export = true;
        self
    }

    /// Add a "Density" texture output splatted from "Filtered"
    pub fn with_texture(mut self) -> Self {
        self.texture = true;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn build(self) -> GraphDeclaration {
        let mut filtered = PinSpec::output_buffer(
            "Filtered",
            4,
            PinSizing::FromInput {
                pin: "Points".into(),
                multiplier: 1,
            },
        )
        .counted();
        if self.export {
            filtered = filtered.with_export(ExportMode::ComputeGraphOutput);
        }

        let mut decl = GraphDeclaration::new(self.name)
            .pin(PinSpec::input_buffer("Seeds", 4))
            .pin(PinSpec::intermediate_buffer(
                "Points",
                4,
                PinSizing::FromInput {
                    pin: "Seeds".into(),
                    multiplier: 2,
                },
            ))
            .pin(filtered)
            .kernel(KernelDecl::new("scatter", scatter).reads("Seeds").writes("Points"))
            .kernel(KernelDecl::new("filter", filter).reads("Points").writes("Filtered"));

        if self.texture {
            decl = decl
                .pin(PinSpec::output_texture("Density", TextureFormat::R32F, 4, 4))
                .kernel(KernelDecl::new("splat", splat).reads("Filtered").writes("Density"));
        }
        decl
    }
}

impl Default for ForestGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed values on the "Seeds" pin
pub fn seeds(values: &[f32]) -> DataCollection {
    DataCollection::new().with("Seeds", PcgData::Buffer(BufferData::from_f32s(1, vec![], values)))
}

/// Place seed values in `exported` as if an earlier execution produced them
pub fn gpu_resident_seeds(exported: &SharedExportedArena, values: &[f32]) -> PcgData {
    let kind = DataKind::Buffer { stride: 4 };
    let desc = ResourceDesc {
        label: "Seeds".to_string(),
        kind,
        element_count: values.len() as u32,
        extent: None,
        attributes: Vec::new(),
    };
    let resource = GpuResource {
        desc,
        bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        counter: None,
    };
    let handle = exported.lock().unwrap().insert(Generation::next(), resource);
    PcgData::GpuResident(GpuResidentData {
        handle,
        kind,
        element_count: values.len() as u32,
        extent: None,
        attributes: Vec::new(),
    })
}

/// Request for the test graph over seeds 1, 2, 3
pub fn forest_request() -> ExecutionRequest {
    ExecutionRequest::new(GRAPH, EXTENT).with_inputs(seeds(&[1.0, 2.0, 3.0]))
}

/// Compiler, render queue and scheduler wired together
pub struct TestBackend {
    pub compiler: Arc<StaticGraphCompiler>,
    pub render: RenderQueue,
    pub scheduler: Arc<SimulatedScheduler>,
    pub graph: Arc<CompiledKernelGraph>,
    pub task_mode: TaskMode,
}

impl TestBackend {
    fn with_queue(decl: &GraphDeclaration, render: RenderQueue, task_mode: TaskMode) -> Self {
        let compiler = Arc::new(StaticGraphCompiler::new());
        let graph = compiler.register(decl, GRID, 0).expect("test graph compiles");
        Self {
            compiler,
            scheduler: Arc::new(SimulatedScheduler::new(render.clone())),
            render,
            graph,
            task_mode,
        }
    }

    /// Render work runs as soon as it is enqueued
    pub fn inline(decl: &GraphDeclaration) -> Self {
        Self::with_queue(decl, RenderQueue::inline(), TaskMode::Inline)
    }

    /// Render work runs when the test pumps the queue
    pub fn deferred(decl: &GraphDeclaration) -> Self {
        Self::with_queue(decl, RenderQueue::deferred(), TaskMode::Inline)
    }

    /// Render work and background tasks run on their own threads
    pub fn threaded(decl: &GraphDeclaration) -> Self {
        Self::with_queue(decl, RenderQueue::threaded(), TaskMode::Threaded)
    }

    pub fn services(&self) -> ExecutorServices {
        ExecutorServices::new(
            self.compiler.clone(),
            self.scheduler.clone(),
            self.render.clone(),
        )
        .with_task_mode(self.task_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forest_graph_builder() {
        let decl = ForestGraphBuilder::new().exported().with_texture().build();
        assert_eq!(decl.pins.len(), 4);
        assert_eq!(decl.kernels.len(), 3);
        assert_eq!(decl.pins[2].export_mode, ExportMode::ComputeGraphOutput);
    }
}
