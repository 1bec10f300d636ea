//! Construction-time parameters of every box.
//!
//! Defaults reproduce the reference rasterizer configuration. Rendering
//! state that changes between draws is not configuration; it arrives as
//! register writes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::layout::{BlockLayout, PixelMapper};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterizerConfig {
    /// Largest supported render target, in pixels.
    pub width: u32,
    pub height: u32,
    pub num_stamp_units: usize,
    /// HZ/Z block edge in pixels.
    pub block_size: u32,
    /// Cycles without progress (with work pending) before a box counts as stalled.
    pub stall_threshold: u64,
    /// Directory for SaveState / RestoreState files.
    pub state_dir: Option<PathBuf>,
    /// Directory for depth and stencil PNG dumps.
    pub dump_dir: Option<PathBuf>,
    pub setup: SetupConfig,
    pub traversal: TraversalConfig,
    pub hz: HzConfig,
    pub interpolator: InterpolatorConfig,
    pub fragment_fifo: FragmentFifoConfig,
    pub zstencil: ZStencilConfig,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 400,
            num_stamp_units: 2,
            block_size: 8,
            stall_threshold: 50_000,
            state_dir: None,
            dump_dir: None,
            setup: SetupConfig::default(),
            traversal: TraversalConfig::default(),
            hz: HzConfig::default(),
            interpolator: InterpolatorConfig::default(),
            fragment_fifo: FragmentFifoConfig::default(),
            zstencil: ZStencilConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub triangles_cycle: u32,
    pub fifo_size: usize,
    pub setup_units: u32,
    /// Cycles between two dispatches to the setup units.
    pub start_latency: u32,
    /// Setup pipeline depth.
    pub latency: u64,
    /// Delegate setup to the unified shader.
    pub shader_setup: bool,
    pub shader_queue_size: usize,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            triangles_cycle: 1,
            fifo_size: 32,
            setup_units: 1,
            start_latency: 4,
            latency: 10,
            shader_setup: false,
            shader_queue_size: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalStrategy {
    Recursive,
    Scanline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub triangles_cycle: u32,
    pub triangle_batch: usize,
    pub triangle_queue_size: usize,
    pub stamps_cycle: u32,
    pub samples_cycle: u32,
    pub strategy: TraversalStrategy,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            triangles_cycle: 1,
            triangle_batch: 2,
            triangle_queue_size: 8,
            stamps_cycle: 2,
            samples_cycle: 2,
            strategy: TraversalStrategy::Recursive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HzConfig {
    pub stamps_cycle: u32,
    pub queue_size: usize,
    pub cache_lines: usize,
    /// Blocks per cache line.
    pub cache_line_size: usize,
    pub buffer_latency: u64,
    pub clear_blocks_cycle: u32,
    /// Bypass the test regardless of the HZ enable register.
    pub disable: bool,
}

impl Default for HzConfig {
    fn default() -> Self {
        Self {
            stamps_cycle: 2,
            queue_size: 64,
            cache_lines: 8,
            cache_line_size: 16,
            buffer_latency: 5,
            clear_blocks_cycle: 256,
            disable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolatorConfig {
    /// Attributes interpolated per cycle.
    pub interpolators: u32,
    pub stamps_cycle: u32,
    pub latency: u64,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            interpolators: 2,
            stamps_cycle: 2,
            latency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentFifoConfig {
    pub num_shaders: usize,
    /// Vertices or triangles gathered before a group is dispatched.
    pub thread_group: usize,
    pub shader_input_queue: usize,
    pub shader_inputs_cycle: u32,
    pub shader_outputs_cycle: u32,
    /// Consecutive inputs sent to one shader before moving on.
    pub shader_input_batch: u32,
    /// Pick the shader from the stamp's screen tile instead of round robin.
    pub tiled_distribution: bool,
    pub vertex_input_queue: usize,
    pub vertex_output_queue: usize,
    pub vertices_cycle: u32,
    pub triangle_input_queue: usize,
    pub triangle_output_queue: usize,
    pub triangle_latency: u32,
    pub rast_queue_size: usize,
    pub test_queue_size: usize,
    pub int_queue_size: usize,
    pub shaded_queue_size: usize,
    /// Stamps per cycle and unit towards Z/Stencil and Color Write.
    pub rop_stamps_cycle: u32,
    pub vertex_group_timeout: u64,
}

impl Default for FragmentFifoConfig {
    fn default() -> Self {
        Self {
            num_shaders: 4,
            thread_group: 4,
            shader_input_queue: 16,
            shader_inputs_cycle: 1,
            shader_outputs_cycle: 1,
            shader_input_batch: 4,
            tiled_distribution: false,
            vertex_input_queue: 32,
            vertex_output_queue: 32,
            vertices_cycle: 1,
            triangle_input_queue: 16,
            triangle_output_queue: 16,
            triangle_latency: 1,
            rast_queue_size: 32,
            test_queue_size: 32,
            int_queue_size: 32,
            shaded_queue_size: 64,
            rop_stamps_cycle: 1,
            vertex_group_timeout: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZStencilConfig {
    pub stamps_cycle: u32,
    pub input_queue: usize,
    pub fetch_queue: usize,
    pub read_queue: usize,
    pub op_queue: usize,
    pub write_queue: usize,
    pub rop_latency: u64,
    /// Cycles between two stamps entering the operation pipeline.
    pub rop_rate: u32,
    pub cache_ways: usize,
    pub cache_lines: usize,
    /// Outstanding memory requests.
    pub cache_request_queue: usize,
    pub memory_latency: u64,
    pub clear_blocks_cycle: u32,
    pub hz_update_latency: u64,
    pub disable_hz_update: bool,
    pub disable_compression: bool,
    pub validation: bool,
}

impl Default for ZStencilConfig {
    fn default() -> Self {
        Self {
            stamps_cycle: 1,
            input_queue: 32,
            fetch_queue: 8,
            read_queue: 8,
            op_queue: 8,
            write_queue: 8,
            rop_latency: 4,
            rop_rate: 1,
            cache_ways: 4,
            cache_lines: 16,
            cache_request_queue: 8,
            memory_latency: 20,
            clear_blocks_cycle: 256,
            hz_update_latency: 10,
            disable_hz_update: false,
            disable_compression: false,
            validation: false,
        }
    }
}

fn require(cond: bool, msg: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        log::error!("invalid configuration: {msg}");
        Err(SimError::InvalidConfig(msg.to_string()))
    }
}

impl RasterizerConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.width, self.height, self.block_size)
    }

    pub fn pixel_mapper(&self) -> PixelMapper {
        PixelMapper::new(self.layout(), self.num_stamp_units)
    }

    /// Reject parameter sets that would deadlock or violate queue invariants.
    pub fn validate(&self) -> Result<()> {
        require(self.width > 0 && self.height > 0, "resolution must be non-zero")?;
        require(self.num_stamp_units > 0, "num_stamp_units must be non-zero")?;
        require(
            self.block_size >= 2 && self.block_size.is_power_of_two(),
            "block_size must be a power of two >= 2",
        )?;

        let s = &self.setup;
        require(s.triangles_cycle > 0 && s.setup_units > 0, "setup throughput must be non-zero")?;
        require(s.start_latency > 0, "setup start_latency must be non-zero")?;
        require(
            s.fifo_size >= s.triangles_cycle as usize,
            "setup fifo_size must hold one cycle of triangles",
        )?;
        require(s.shader_queue_size > 0, "setup shader_queue_size must be non-zero")?;

        let t = &self.traversal;
        require(t.triangles_cycle > 0 && t.stamps_cycle > 0, "traversal throughput must be non-zero")?;
        require(t.triangle_batch > 0, "traversal triangle_batch must be non-zero")?;
        require(t.samples_cycle > 0, "traversal samples_cycle must be non-zero")?;
        require(
            t.triangle_queue_size >= t.triangles_cycle as usize,
            "traversal triangle_queue_size must hold one cycle of triangles",
        )?;

        let h = &self.hz;
        require(h.stamps_cycle > 0, "hz stamps_cycle must be non-zero")?;
        require(
            h.queue_size > 2 * h.stamps_cycle as usize,
            "hz queue_size must exceed twice stamps_cycle",
        )?;
        require(h.cache_lines > 0 && h.cache_line_size > 0, "hz cache geometry must be non-zero")?;
        require(h.clear_blocks_cycle > 0, "hz clear_blocks_cycle must be non-zero")?;

        let i = &self.interpolator;
        require(i.interpolators > 0 && i.stamps_cycle > 0, "interpolator throughput must be non-zero")?;

        let f = &self.fragment_fifo;
        require(f.num_shaders > 0, "fragment_fifo num_shaders must be non-zero")?;
        require(f.thread_group > 0, "fragment_fifo thread_group must be non-zero")?;
        require(
            f.shader_inputs_cycle > 0 && f.shader_outputs_cycle > 0 && f.shader_input_batch > 0,
            "fragment_fifo shader throughput must be non-zero",
        )?;
        require(f.rop_stamps_cycle > 0 && f.vertices_cycle > 0, "fragment_fifo throughput must be non-zero")?;
        require(
            f.rast_queue_size >= 2 * h.stamps_cycle as usize,
            "fragment_fifo rast_queue_size must hold two cycles of HZ output",
        )?;
        require(
            f.test_queue_size > 2 * f.rop_stamps_cycle as usize,
            "fragment_fifo test_queue_size must exceed twice rop_stamps_cycle",
        )?;
        require(
            f.int_queue_size >= i.stamps_cycle as usize,
            "fragment_fifo int_queue_size must hold one cycle of interpolator output",
        )?;
        require(
            f.shaded_queue_size > 0 && f.shader_input_queue > 0,
            "fragment_fifo shader queues must be non-zero",
        )?;
        require(
            f.vertex_input_queue >= 2 * f.num_shaders && f.vertex_output_queue > 0,
            "fragment_fifo vertex_input_queue must hold two vertices per shader",
        )?;
        require(
            f.triangle_input_queue >= ((1 + f.triangle_latency) * s.triangles_cycle) as usize
                && f.triangle_output_queue > 0,
            "fragment_fifo triangle queues too small",
        )?;

        let z = &self.zstencil;
        require(z.stamps_cycle > 0 && z.rop_rate > 0, "zstencil throughput must be non-zero")?;
        require(
            f.rop_stamps_cycle <= z.stamps_cycle,
            "fragment_fifo rop_stamps_cycle must not exceed zstencil stamps_cycle",
        )?;
        require(
            z.input_queue > 2 * z.stamps_cycle as usize,
            "zstencil input_queue must exceed twice stamps_cycle",
        )?;
        require(
            z.fetch_queue > 0 && z.read_queue > 0 && z.write_queue > 0,
            "zstencil queues must be non-zero",
        )?;
        require(
            z.op_queue as u64 > z.rop_latency,
            "zstencil op_queue must exceed rop_latency",
        )?;
        require(
            z.cache_ways > 0 && z.cache_lines > 0 && z.cache_request_queue > 0,
            "zstencil cache geometry must be non-zero",
        )?;
        require(z.clear_blocks_cycle > 0, "zstencil clear_blocks_cycle must be non-zero")?;
        Ok(())
    }
}
