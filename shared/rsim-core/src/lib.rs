//! Shared building blocks for the rasterizer pipeline boxes.
//!
//! Every stage crate depends on this one for the inter-box plumbing
//! (signals, bounded queues, reorder buffers), the packets that flow
//! through the pipeline (stamps, triangles, vertices, shader work) and the
//! register/command vocabulary the Command Processor speaks.

/// Handle-indexed slab storage for in-flight records.
pub mod arena;
/// Rasterizer commands and the per-box state machine.
pub mod command;
/// Box parameters loaded from JSON.
pub mod config;
/// Recoverable error type for persistence and configuration.
pub mod error;
/// Pixel, stamp, block and stamp-unit address mapping.
pub mod layout;
/// Little-endian framing for persisted buffers.
pub mod persist;
/// Triangle, vertex and shader traffic packets.
pub mod primitive;
/// Bounded circular queue.
pub mod queue;
/// GPU register identifiers and payloads.
pub mod regs;
/// In-order commit of out-of-order completions.
pub mod reorder;
/// Fixed-latency inter-box channels.
pub mod signal;
/// The common box interface and stall bookkeeping.
pub mod stage;
/// Fragment stamps.
pub mod stamp;
/// Named event counters.
pub mod stats;

pub use arena::{Arena, Handle};
pub use command::{RasterizerCommand, RasterizerState};
pub use config::RasterizerConfig;
pub use error::{Result, SimError};
pub use layout::{BlockLayout, PixelMapper};
pub use queue::RingQueue;
pub use regs::{CompareFunction, CullMode, FaceMode, GpuRegData, GpuRegister, StencilUpdate};
pub use reorder::{ReorderBuffer, Slot};
pub use signal::Signal;
pub use stage::{PipelineStage, StallStatus, UnitState};
pub use primitive::HzUpdate;
pub use stamp::{Fragment, Stamp, TriangleId};
pub use stats::Statistics;
