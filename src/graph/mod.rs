//! Kernel graphs: declaration, compilation and the compiler seam.
//!
//! # Architecture
//!
//! ```text
//! GraphDeclaration ──► KernelGraphCompiler ──► CompiledKernelGraph
//!                                                    │
//!                      StaticGraphCompiler ◄─────────┘ (keyed by top-level, grid, index)
//!                              │
//!                              └──► GraphCompiler trait, polled by the executor
//! ```

pub mod compiled;
pub mod compiler;
pub mod declaration;

pub use compiled::{CompileMessage, CompileSeverity, CompileStats, CompiledKernel, CompiledKernelGraph};
pub use compiler::{GraphCompiler, KernelGraphCompiler, StaticGraphCompiler};
pub use declaration::{
    GraphDeclaration, GraphSettings, KernelDecl, KernelProgram, PinDirection, PinSizing, PinSpec,
};
