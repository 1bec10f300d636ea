//! Cycle-level rasterizer pipeline simulator.
//!
//! [`Rasterizer`] owns the stage boxes and drives them through the command
//! protocol. The [`bench`] module provides the collaborators that sit
//! around it in a full GPU (command processor, streamer, shader units and
//! color write), and [`Simulator`] clocks the whole thing for a [`Scene`].

pub mod bench;
pub mod rasterizer;
pub mod scene;
pub mod simulator;

pub use bench::BenchConfig;
pub use rasterizer::{Rasterizer, RasterizerPorts, Unit};
pub use scene::{DrawCall, Scene, SceneOp};
pub use simulator::{RunSummary, Simulator};

use thiserror::Error;

/// Failures of a driven run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Stall detection fired; `report` is the pipeline's stall report.
    #[error("pipeline stalled at cycle {cycle}\n{report}")]
    Stalled { cycle: u64, report: String },

    #[error("scene did not finish within {0} cycles")]
    CycleLimit(u64),

    #[error("invalid scene: {0}")]
    InvalidScene(String),

    #[error(transparent)]
    Sim(#[from] rsim_core::SimError),
}
