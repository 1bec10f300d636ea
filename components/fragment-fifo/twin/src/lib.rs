//! Fragment FIFO box.
//!
//! Directs every piece of work that goes through the unified shaders:
//! vertices from the streamer, triangle setups delegated by TriangleSetup
//! and fragment stamps from Hierarchical Z. Shaders may finish work in any
//! order; each traffic class is committed back in submission order through
//! its own [`ReorderBuffer`].
//!
//! Stamps of each stamp unit follow one of two paths, chosen per draw:
//!
//! * early Z: rast -> Z/Stencil -> test -> Interpolator -> int -> shader
//!   -> shaded -> Color Write
//! * late Z: rast -> Interpolator -> int -> shader -> shaded -> Z/Stencil
//!   -> test -> Color Write
//!
//! Stamps live in an [`Arena`] while they are inside the box; the queues
//! move handles. Work sent to a neighbour reserves its slot in the queue it
//! comes back to, so a returning stamp always finds room.

use std::collections::VecDeque;

use rsim_core::command::unsupported;
use rsim_core::config::FragmentFifoConfig;
use rsim_core::primitive::{
    ShaderPayload, ShaderTag, ShaderWork, TriangleShaderInput, TriangleShaderOutput, VertexInput,
};
use rsim_core::stage::ProgressMonitor;
use rsim_core::stamp::MAX_FRAGMENT_ATTRIBUTES;
use rsim_core::{
    Arena, BlockLayout, GpuRegData, GpuRegister, Handle, PipelineStage, RasterizerCommand,
    RasterizerConfig, RasterizerState, ReorderBuffer, RingQueue, Signal, Stamp, StallStatus,
    Statistics, UnitState,
};

#[derive(Debug, Clone)]
pub struct FragmentFifoPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Stamps from Hierarchical Z.
    pub hz_input: Signal<Stamp>,
    pub hz_state: Signal<UnitState>,
    pub interpolator_output: Signal<Stamp>,
    pub interpolator_state: Signal<UnitState>,
    pub interpolator_input: Signal<Stamp>,
    /// Per stamp unit.
    pub zst_output: Vec<Signal<Stamp>>,
    pub zst_state: Vec<Signal<UnitState>>,
    pub zst_input: Vec<Signal<Stamp>>,
    pub zst_input_state: Vec<Signal<UnitState>>,
    /// Per stamp unit.
    pub cw_output: Vec<Signal<Stamp>>,
    pub cw_state: Vec<Signal<UnitState>>,
    /// Per shader unit.
    pub shader_input: Vec<Signal<ShaderWork>>,
    pub shader_state: Vec<Signal<UnitState>>,
    pub shader_output: Vec<Signal<ShaderWork>>,
    /// Vertices from the streamer and shaded vertices back.
    pub vertex_input: Signal<VertexInput>,
    pub vertex_state: Signal<UnitState>,
    pub vertex_output: Signal<VertexInput>,
    /// Triangle setups delegated by TriangleSetup.
    pub triangle_input: Signal<TriangleShaderInput>,
    pub triangle_state: Signal<UnitState>,
    pub triangle_output: Signal<TriangleShaderOutput>,
}

fn per_unit<T>(prefix: &str, n: usize, bandwidth: u32) -> Vec<Signal<T>> {
    (0..n)
        .map(|i| Signal::new(format!("{prefix}{i}"), bandwidth, 1))
        .collect()
}

impl FragmentFifoPorts {
    /// Fresh signals for every neighbour, sized from the whole pipeline
    /// configuration.
    pub fn new(cfg: &RasterizerConfig) -> Self {
        let f = &cfg.fragment_fifo;
        let units = cfg.num_stamp_units;
        let tc = cfg.setup.triangles_cycle;
        Self {
            command: Signal::state("RasterizerToFragmentFIFO"),
            state: Signal::state("FragmentFIFOState"),
            hz_input: Signal::new("HierarchicalZToFragmentFIFO", cfg.hz.stamps_cycle, 1),
            hz_state: Signal::state("FragmentFIFOToHierarchicalZState"),
            interpolator_output: Signal::new("FragmentFIFOToInterpolator", cfg.interpolator.stamps_cycle, 1),
            interpolator_state: Signal::state("InterpolatorToFragmentFIFOState"),
            interpolator_input: Signal::new("InterpolatorToFragmentFIFO", cfg.interpolator.stamps_cycle, 1),
            zst_output: per_unit("FragmentFIFOToZStencilTest", units, f.rop_stamps_cycle),
            zst_state: per_unit("ZStencilTestToFragmentFIFOState", units, 1),
            zst_input: per_unit("ZStencilTestToFragmentFIFO", units, cfg.zstencil.stamps_cycle),
            zst_input_state: per_unit("FragmentFIFOToZStencilTestState", units, 1),
            cw_output: per_unit("FragmentFIFOToColorWrite", units, f.rop_stamps_cycle),
            cw_state: per_unit("ColorWriteToFragmentFIFOState", units, 1),
            shader_input: per_unit("FragmentFIFOToShader", f.num_shaders, f.shader_inputs_cycle),
            shader_state: per_unit("ShaderToFragmentFIFOState", f.num_shaders, 1),
            shader_output: per_unit("ShaderToFragmentFIFO", f.num_shaders, f.shader_outputs_cycle),
            vertex_input: Signal::new("StreamerToFragmentFIFO", f.vertices_cycle, 1),
            vertex_state: Signal::state("FragmentFIFOToStreamerState"),
            vertex_output: Signal::new("FragmentFIFOToStreamer", f.vertices_cycle, 1),
            triangle_input: Signal::new("SetupToFragmentFIFO", tc, f.triangle_latency as u64),
            triangle_state: Signal::state("FragmentFIFOTriangleState"),
            triangle_output: Signal::new("FragmentFIFOToSetup", tc, 1),
        }
    }
}

/// Queues of one stamp unit.
#[derive(Debug)]
struct UnitQueues {
    rast: RingQueue<Handle>,
    test: RingQueue<Handle>,
    int: RingQueue<Handle>,
    shaded: ReorderBuffer<Handle>,
    /// Sent to the Interpolator; each holds a slot in `int`.
    interp_pending: VecDeque<Handle>,
    /// Sent to Z/Stencil; each holds a slot in `test`.
    zst_pending: VecDeque<Handle>,
    zst_ready: UnitState,
    cw_ready: UnitState,
    last_forwarded: bool,
    zst_progress: ProgressMonitor,
    cw_progress: ProgressMonitor,
}

impl UnitQueues {
    fn new(cfg: &FragmentFifoConfig) -> Self {
        Self {
            rast: RingQueue::new("FFIFO rasterized stamps", cfg.rast_queue_size),
            test: RingQueue::new("FFIFO tested stamps", cfg.test_queue_size),
            int: RingQueue::new("FFIFO interpolated stamps", cfg.int_queue_size),
            shaded: ReorderBuffer::new("FFIFO shaded stamps", cfg.shaded_queue_size),
            interp_pending: VecDeque::new(),
            zst_pending: VecDeque::new(),
            zst_ready: UnitState::Busy,
            cw_ready: UnitState::Busy,
            last_forwarded: false,
            zst_progress: ProgressMonitor::default(),
            cw_progress: ProgressMonitor::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.rast.is_empty()
            && self.test.is_empty()
            && self.int.is_empty()
            && self.shaded.is_empty()
            && self.interp_pending.is_empty()
            && self.zst_pending.is_empty()
    }
}

#[derive(Debug)]
struct ShaderSlot {
    queue: RingQueue<ShaderWork>,
    ready: UnitState,
    in_flight: usize,
    progress: ProgressMonitor,
}

pub struct FragmentFifo {
    name: String,
    cfg: FragmentFifoConfig,
    ports: FragmentFifoPorts,
    layout: BlockLayout,
    state: RasterizerState,

    early_z_enabled: bool,
    depth_test: bool,
    stencil_test: bool,
    modify_depth: bool,
    attributes: [bool; MAX_FRAGMENT_ATTRIBUTES],
    /// Path of the current draw.
    early_z: bool,

    stamps: Arena<Stamp>,
    units: Vec<UnitQueues>,
    shaders: Vec<ShaderSlot>,
    interp_ready: UnitState,
    interp_unit: usize,
    fragment_unit: usize,
    fragment_shader: usize,
    fragment_batch: u32,
    geometry_shader: usize,

    vertex_in: RingQueue<VertexInput>,
    vertex_rob: ReorderBuffer<VertexInput>,
    last_vertex_pending: bool,
    last_group_cycle: u64,
    triangle_in: RingQueue<TriangleShaderInput>,
    triangle_rob: ReorderBuffer<TriangleShaderInput>,

    stats: Statistics,
    progress: ProgressMonitor,
}

impl FragmentFifo {
    /// Stamp units and shader units are taken from the port vectors.
    pub fn new(name: impl Into<String>, cfg: FragmentFifoConfig, ports: FragmentFifoPorts, layout: BlockLayout) -> Self {
        let units = ports.zst_output.len();
        let shaders = ports.shader_input.len();
        assert!(units > 0 && shaders > 0, "FragmentFIFO needs stamp units and shaders");
        let per_unit = cfg.rast_queue_size + cfg.test_queue_size + cfg.int_queue_size + cfg.shaded_queue_size;
        Self {
            name: name.into(),
            stamps: Arena::new("FFIFO stamps", units * per_unit),
            units: (0..units).map(|_| UnitQueues::new(&cfg)).collect(),
            shaders: (0..shaders)
                .map(|_| ShaderSlot {
                    queue: RingQueue::new("FFIFO shader input", cfg.shader_input_queue),
                    ready: UnitState::Busy,
                    in_flight: 0,
                    progress: ProgressMonitor::default(),
                })
                .collect(),
            vertex_in: RingQueue::new("FFIFO vertex input", cfg.vertex_input_queue),
            vertex_rob: ReorderBuffer::new("FFIFO shaded vertices", cfg.vertex_output_queue),
            triangle_in: RingQueue::new("FFIFO triangle input", cfg.triangle_input_queue),
            triangle_rob: ReorderBuffer::new("FFIFO shaded triangles", cfg.triangle_output_queue),
            cfg,
            ports,
            layout,
            state: RasterizerState::Reset,
            early_z_enabled: true,
            depth_test: false,
            stencil_test: false,
            modify_depth: false,
            attributes: [false; MAX_FRAGMENT_ATTRIBUTES],
            early_z: true,
            interp_ready: UnitState::Busy,
            interp_unit: 0,
            fragment_unit: 0,
            fragment_shader: 0,
            fragment_batch: 0,
            geometry_shader: 0,
            last_vertex_pending: false,
            last_group_cycle: 0,
            stats: Statistics::with_counters(&[
                "inputs", "outputs_zst", "outputs_cw", "culled", "shader_inputs", "shader_outputs",
                "vertices", "triangles", "cycles", "rast_level", "test_level", "int_level", "shaded_level",
            ]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &FragmentFifoPorts {
        &self.ports
    }

    /// Whether the current (or next) draw tests depth before shading.
    pub fn early_z(&self) -> bool {
        self.early_z
    }

    fn reset(&mut self) {
        self.early_z_enabled = true;
        self.depth_test = false;
        self.stencil_test = false;
        self.modify_depth = false;
        self.attributes = [false; MAX_FRAGMENT_ATTRIBUTES];
        self.early_z = true;
        self.stamps.clear();
        self.units = (0..self.units.len()).map(|_| UnitQueues::new(&self.cfg)).collect();
        for s in &mut self.shaders {
            s.queue.clear();
            s.in_flight = 0;
        }
        self.vertex_in.clear();
        self.vertex_rob.clear();
        self.triangle_in.clear();
        self.triangle_rob.clear();
        self.last_vertex_pending = false;
        self.interp_unit = 0;
        self.fragment_unit = 0;
        self.fragment_shader = 0;
        self.fragment_batch = 0;
        self.geometry_shader = 0;
    }

    fn process_command(&mut self, cycle: u64, command: RasterizerCommand) {
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                self.early_z = self.early_z_enabled && !self.modify_depth;
                for u in &mut self.units {
                    u.last_forwarded = false;
                }
                log::debug!(
                    "{} cycle {cycle}: draw ({} Z, depth {} stencil {})",
                    self.name,
                    if self.early_z { "early" } else { "late" },
                    self.depth_test,
                    self.stencil_test
                );
                self.state = RasterizerState::Drawing;
            }
            (RasterizerState::Ready, RasterizerCommand::RegisterWrite { reg, subreg, data }) => {
                self.process_register_write(reg, subreg, data)
            }
            (RasterizerState::End, RasterizerCommand::End) => self.state = RasterizerState::Ready,
            (state, command) => unsupported(&self.name, state, &command),
        }
    }

    fn process_register_write(&mut self, reg: GpuRegister, subreg: u32, data: GpuRegData) {
        match reg {
            GpuRegister::EarlyZ => self.early_z_enabled = data.as_bool(),
            GpuRegister::DepthTest => self.depth_test = data.as_bool(),
            GpuRegister::StencilTest => self.stencil_test = data.as_bool(),
            GpuRegister::ModifyFragmentDepth => self.modify_depth = data.as_bool(),
            GpuRegister::FragmentInputAttributes if (subreg as usize) < MAX_FRAGMENT_ATTRIBUTES => {
                self.attributes[subreg as usize] = data.as_bool()
            }
            other => panic!("{}: unsupported register {other:?} [{subreg}]", self.name),
        }
    }

    fn read_states(&mut self, cycle: u64) {
        if let Some(s) = self.ports.interpolator_state.read_latest(cycle) {
            self.interp_ready = s;
        }
        for (u, unit) in self.units.iter_mut().enumerate() {
            if let Some(s) = self.ports.zst_state[u].read_latest(cycle) {
                unit.zst_ready = s;
            }
            if let Some(s) = self.ports.cw_state[u].read_latest(cycle) {
                unit.cw_ready = s;
            }
        }
        for (i, shader) in self.shaders.iter_mut().enumerate() {
            if let Some(s) = self.ports.shader_state[i].read_latest(cycle) {
                shader.ready = s;
            }
        }
    }

    // Fragment path.

    /// Tested stamps coming back from Z/Stencil.
    fn test_end(&mut self, cycle: u64, u: usize) {
        while let Some(stamp) = self.ports.zst_input[u].read(cycle) {
            let unit = &mut self.units[u];
            let Some(h) = unit.zst_pending.pop_front() else {
                panic!("{}: unexpected stamp from Z/Stencil unit {u}", self.name);
            };
            unit.zst_progress.note(cycle);
            self.progress.note(cycle);
            if !stamp.marker && stamp.all_culled() {
                self.stats.inc("culled");
                if !stamp.last {
                    self.stamps.remove(h);
                    continue;
                }
                *self.stamps.get_mut(h) = stamp.into_marker();
            } else {
                *self.stamps.get_mut(h) = stamp;
            }
            unit.test.push(h);
        }
    }

    /// Early Z: rasterized stamps. Late Z: shaded stamps.
    fn test_start(&mut self, cycle: u64, u: usize) {
        if !self.units[u].zst_ready.accepts() {
            return;
        }
        for _ in 0..self.cfg.rop_stamps_cycle {
            let unit = &mut self.units[u];
            if unit.test.free() <= unit.zst_pending.len() {
                break;
            }
            let next = if self.early_z { unit.rast.pop() } else { unit.shaded.pop_ready() };
            let Some(h) = next else {
                break;
            };
            unit.zst_pending.push_back(h);
            unit.zst_progress.note(cycle);
            let stamp = self.stamps.get(h).clone();
            if !stamp.marker {
                self.stats.inc("outputs_zst");
            }
            self.ports.zst_output[u].write(cycle, stamp);
            self.progress.note(cycle);
        }
    }

    /// Early Z: shaded stamps. Late Z: tested stamps.
    fn send_color_write(&mut self, cycle: u64, u: usize) {
        if !self.units[u].cw_ready.accepts() {
            return;
        }
        for _ in 0..self.cfg.rop_stamps_cycle {
            let unit = &mut self.units[u];
            let next = if self.early_z { unit.shaded.pop_ready() } else { unit.test.pop() };
            let Some(h) = next else {
                break;
            };
            let stamp = self.stamps.remove(h);
            if stamp.last {
                unit.last_forwarded = true;
            }
            if !stamp.marker {
                self.stats.inc("outputs_cw");
            }
            unit.cw_progress.note(cycle);
            self.ports.cw_output[u].write(cycle, stamp);
            self.progress.note(cycle);
        }
    }

    fn forward_rops(&mut self, cycle: u64) {
        for u in 0..self.units.len() {
            self.test_end(cycle, u);
            self.send_color_write(cycle, u);
            if !self.early_z {
                self.test_start(cycle, u);
            }
        }
    }

    fn interpolation_end(&mut self, cycle: u64) {
        while let Some(stamp) = self.ports.interpolator_input.read(cycle) {
            let u = stamp.unit;
            let unit = &mut self.units[u];
            let Some(h) = unit.interp_pending.pop_front() else {
                panic!("{}: unexpected stamp from the Interpolator for unit {u}", self.name);
            };
            *self.stamps.get_mut(h) = stamp;
            unit.int.push(h);
            self.progress.note(cycle);
        }
    }

    /// Early Z: tested stamps. Late Z: rasterized stamps. Units are served
    /// round robin.
    fn interpolation_start(&mut self, cycle: u64) {
        if !self.interp_ready.accepts() {
            return;
        }
        let n = self.units.len();
        let rate = self.ports.interpolator_output.bandwidth();
        let (mut sent, mut idle) = (0, 0);
        while sent < rate && idle < n {
            let u = self.interp_unit;
            self.interp_unit = (u + 1) % n;
            let unit = &mut self.units[u];
            let next = if unit.int.free() <= unit.interp_pending.len() {
                None
            } else if self.early_z {
                unit.test.pop()
            } else {
                unit.rast.pop()
            };
            let Some(h) = next else {
                idle += 1;
                continue;
            };
            unit.interp_pending.push_back(h);
            self.ports.interpolator_output.write(cycle, self.stamps.get(h).clone());
            self.progress.note(cycle);
            sent += 1;
            idle = 0;
        }
    }

    fn receive_stamps(&mut self, cycle: u64) {
        while let Some(stamp) = self.ports.hz_input.read(cycle) {
            let u = stamp.unit;
            if u >= self.units.len() {
                panic!("{}: stamp for unknown stamp unit {u}", self.name);
            }
            if !stamp.marker {
                self.stats.inc("inputs");
            }
            let h = self.stamps.insert(stamp);
            self.units[u].rast.push(h);
            self.progress.note(cycle);
        }
    }

    // Shader traffic.

    fn commit(&mut self, cycle: u64) {
        for _ in 0..self.ports.vertex_output.bandwidth() {
            let Some(v) = self.vertex_rob.pop_ready() else {
                break;
            };
            if v.last {
                self.last_vertex_pending = false;
            }
            self.ports.vertex_output.write(cycle, v);
            self.stats.inc("vertices");
            self.progress.note(cycle);
        }
        for _ in 0..self.ports.triangle_output.bandwidth() {
            let Some(t) = self.triangle_rob.pop_ready() else {
                break;
            };
            self.ports.triangle_output.write(cycle, t);
            self.stats.inc("triangles");
            self.progress.note(cycle);
        }
    }

    fn collect_shader_outputs(&mut self, cycle: u64) {
        for s in 0..self.shaders.len() {
            let outputs = self.ports.shader_output[s].read_up_to(cycle, self.cfg.shader_outputs_cycle as usize);
            for work in outputs {
                let shader = &mut self.shaders[s];
                if shader.in_flight == 0 {
                    panic!("{}: shader {s} returned work that was never sent", self.name);
                }
                shader.in_flight -= 1;
                shader.progress.note(cycle);
                self.stats.inc("shader_outputs");
                self.progress.note(cycle);
                match (work.tag, work.payload) {
                    (ShaderTag::Vertex { entry }, ShaderPayload::Vertex(v)) => {
                        self.vertex_rob.complete(entry, Some(v))
                    }
                    (ShaderTag::Triangle { entry }, ShaderPayload::Triangle(t)) => {
                        self.triangle_rob.complete(entry, Some(t))
                    }
                    (ShaderTag::Fragment { unit, entry }, ShaderPayload::Fragment(stamp)) => {
                        let shaded = &mut self.units[unit].shaded;
                        let Some(&h) = shaded.get(entry) else {
                            panic!("{}: shaded stamp for a free entry of unit {unit}", self.name);
                        };
                        *self.stamps.get_mut(h) = *stamp;
                        shaded.complete(entry, None);
                    }
                    (tag, _) => panic!("{}: shader output does not match its tag {tag:?}", self.name),
                }
            }
        }
    }

    fn receive_geometry(&mut self, cycle: u64) {
        while let Some(v) = self.ports.vertex_input.read(cycle) {
            if v.last {
                self.last_vertex_pending = true;
            }
            self.vertex_in.push(v);
            self.progress.note(cycle);
        }
        while let Some(t) = self.ports.triangle_input.read(cycle) {
            self.triangle_in.push(t);
            self.progress.note(cycle);
        }
    }

    fn vertex_group_ready(&self, cycle: u64) -> bool {
        let n = self.vertex_in.len();
        n > 0
            && (n >= self.cfg.thread_group
                || self.last_vertex_pending
                || cycle.saturating_sub(self.last_group_cycle) > self.cfg.vertex_group_timeout)
    }

    fn dispatch_vertices(&mut self, cycle: u64) -> bool {
        let group = self.vertex_in.len().min(self.cfg.thread_group);
        let target = self.geometry_shader;
        if self.shaders[target].queue.free() < group || self.vertex_rob.free() < group {
            return false;
        }
        for _ in 0..group {
            let Some(v) = self.vertex_in.pop() else {
                break;
            };
            let entry = self.vertex_rob.reserve(v.clone());
            self.shaders[target].queue.push(ShaderWork {
                tag: ShaderTag::Vertex { entry },
                payload: ShaderPayload::Vertex(v),
            });
        }
        log::trace!("{} cycle {cycle}: {group} vertices to shader {target}", self.name);
        self.last_group_cycle = cycle;
        self.geometry_shader = (target + 1) % self.shaders.len();
        true
    }

    fn dispatch_triangles(&mut self, budget: usize) -> usize {
        let mut used = 0;
        while used < budget && !self.triangle_in.is_empty() && !self.triangle_rob.is_full() {
            let target = self.geometry_shader;
            if self.shaders[target].queue.is_full() {
                break;
            }
            let Some(t) = self.triangle_in.pop() else {
                break;
            };
            let entry = self.triangle_rob.reserve(t.clone());
            self.shaders[target].queue.push(ShaderWork {
                tag: ShaderTag::Triangle { entry },
                payload: ShaderPayload::Triangle(t),
            });
            self.geometry_shader = (target + 1) % self.shaders.len();
            used += 1;
        }
        used
    }

    fn shader_for(&self, stamp: &Stamp) -> usize {
        if self.cfg.tiled_distribution {
            self.layout.block_of(stamp.x, stamp.y) as usize % self.shaders.len()
        } else {
            self.fragment_shader
        }
    }

    fn advance_fragment_shader(&mut self) {
        if self.cfg.tiled_distribution {
            return;
        }
        self.fragment_batch += 1;
        if self.fragment_batch >= self.cfg.shader_input_batch {
            self.fragment_batch = 0;
            self.fragment_shader = (self.fragment_shader + 1) % self.shaders.len();
        }
    }

    /// Interpolated stamps to the shaders. Markers take their shaded slot
    /// without a shader round trip.
    fn dispatch_fragments(&mut self, mut budget: usize) {
        let n = self.units.len();
        let mut idle = 0;
        while budget > 0 && idle < n {
            let u = self.fragment_unit;
            let unit = &self.units[u];
            let head = match unit.int.front() {
                Some(&h) if !unit.shaded.is_full() => h,
                _ => {
                    self.fragment_unit = (u + 1) % n;
                    idle += 1;
                    continue;
                }
            };
            if self.stamps.get(head).marker {
                let unit = &mut self.units[u];
                unit.int.pop();
                let slot = unit.shaded.reserve(head);
                unit.shaded.complete(slot, None);
                idle = 0;
                continue;
            }
            let target = self.shader_for(self.stamps.get(head));
            if self.shaders[target].queue.is_full() {
                self.fragment_unit = (u + 1) % n;
                idle += 1;
                continue;
            }
            let unit = &mut self.units[u];
            unit.int.pop();
            let entry = unit.shaded.reserve(head);
            let stamp = self.stamps.get(head).clone();
            self.shaders[target].queue.push(ShaderWork {
                tag: ShaderTag::Fragment { unit: u, entry },
                payload: ShaderPayload::Fragment(Box::new(stamp)),
            });
            self.advance_fragment_shader();
            self.fragment_unit = (u + 1) % n;
            budget -= 1;
            idle = 0;
        }
    }

    /// Vertices first, then triangles, then fragments.
    fn dispatch(&mut self, cycle: u64) {
        if self.vertex_group_ready(cycle) && self.dispatch_vertices(cycle) {
            return;
        }
        let budget = self.shaders.len() * self.cfg.shader_inputs_cycle as usize;
        let used = self.dispatch_triangles(budget);
        if self.state == RasterizerState::Drawing {
            self.dispatch_fragments(budget - used);
        }
    }

    fn transmit(&mut self, cycle: u64) {
        for (s, shader) in self.shaders.iter_mut().enumerate() {
            if !shader.ready.accepts() {
                continue;
            }
            for _ in 0..self.cfg.shader_inputs_cycle {
                let Some(work) = shader.queue.pop() else {
                    break;
                };
                shader.in_flight += 1;
                shader.progress.note(cycle);
                self.stats.inc("shader_inputs");
                self.ports.shader_input[s].write(cycle, work);
            }
        }
    }

    fn sample_levels(&mut self) {
        let sum = |f: fn(&UnitQueues) -> usize| self.units.iter().map(f).sum::<usize>() as u64;
        let rast = sum(|u| u.rast.len());
        let test = sum(|u| u.test.len());
        let int = sum(|u| u.int.len());
        let shaded = sum(|u| u.shaded.len());
        self.stats.inc("cycles");
        self.stats.add("rast_level", rast);
        self.stats.add("test_level", test);
        self.stats.add("int_level", int);
        self.stats.add("shaded_level", shaded);
    }

    fn report_states(&mut self, cycle: u64) {
        let drawing = self.state == RasterizerState::Drawing;
        let hz_room = 2 * self.ports.hz_input.bandwidth() as usize;
        let hz_ready = drawing && self.units.iter().all(|u| u.rast.free() >= hz_room);
        self.ports
            .hz_state
            .write(cycle, if hz_ready { UnitState::Ready } else { UnitState::Busy });
        for s in &self.ports.zst_input_state {
            s.write(cycle, if drawing { UnitState::Ready } else { UnitState::Busy });
        }

        let active = self.state != RasterizerState::Reset;
        let vertex_state = if !active {
            UnitState::Busy
        } else if self.vertex_in.is_empty() && self.vertex_rob.is_empty() {
            UnitState::Empty
        } else if self.vertex_in.free() >= 2 * self.ports.vertex_input.bandwidth() as usize {
            UnitState::Ready
        } else {
            UnitState::Busy
        };
        self.ports.vertex_state.write(cycle, vertex_state);

        let tc = self.ports.triangle_input.bandwidth() as usize;
        let triangle_ready = active && self.triangle_in.free() >= (1 + self.cfg.triangle_latency as usize) * tc;
        self.ports
            .triangle_state
            .write(cycle, if triangle_ready { UnitState::Ready } else { UnitState::Busy });
        self.ports.state.write(cycle, self.state);
    }

    fn draw_finished(&self) -> bool {
        self.units.iter().all(|u| u.last_forwarded && u.is_empty()) && self.stamps.live() == 0
    }
}

impl PipelineStage for FragmentFifo {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        self.read_states(cycle);
        match self.state {
            RasterizerState::Reset => {
                self.reset();
                self.state = RasterizerState::Ready;
            }
            RasterizerState::Ready | RasterizerState::Drawing | RasterizerState::End => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
            }
            other => panic!("{}: unsupported state {other}", self.name),
        }

        if self.state != RasterizerState::Reset {
            let drawing = self.state == RasterizerState::Drawing;
            if drawing {
                self.forward_rops(cycle);
            }
            self.commit(cycle);
            self.collect_shader_outputs(cycle);
            self.receive_geometry(cycle);
            self.dispatch(cycle);
            self.transmit(cycle);
            if drawing {
                self.interpolation_end(cycle);
                self.interpolation_start(cycle);
                if self.early_z {
                    for u in 0..self.units.len() {
                        self.test_start(cycle, u);
                    }
                }
                self.receive_stamps(cycle);
                self.sample_levels();
                if self.draw_finished() {
                    log::debug!("{} cycle {cycle}: end of draw", self.name);
                    self.state = RasterizerState::End;
                }
            }
        }
        self.report_states(cycle);
    }

    fn state(&self) -> RasterizerState {
        self.state
    }

    fn get_state(&self) -> String {
        let sum = |f: fn(&UnitQueues) -> usize| self.units.iter().map(f).sum::<usize>();
        format!(
            " state = {} | Rast = {} | Test = {} | Int = {} | Shaded = {} | Vertices = {}/{} | Triangles = {}/{} | Early Z = {} | Attributes = {}",
            self.state,
            sum(|u| u.rast.len()),
            sum(|u| u.test.len()),
            sum(|u| u.int.len()),
            sum(|u| u.shaded.len()),
            self.vertex_in.len(),
            self.vertex_rob.len(),
            self.triangle_in.len(),
            self.triangle_rob.len(),
            self.early_z,
            self.attributes.iter().filter(|a| **a).count()
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn command_list(&self) -> Vec<&'static str> {
        vec![
            "queues - per stamp unit queue occupancy",
            "shaders - per shader queued and in-flight work",
        ]
    }

    fn exec_box_command(&mut self, command: &str, _args: &[&str]) -> Option<String> {
        match command {
            "queues" => Some(
                self.units
                    .iter()
                    .enumerate()
                    .map(|(i, u)| {
                        format!(
                            "unit {i}: rast {} test {} int {} shaded {} (outstanding {}) | interp {} zst {} | last {}\n",
                            u.rast.len(),
                            u.test.len(),
                            u.int.len(),
                            u.shaded.len(),
                            u.shaded.outstanding(),
                            u.interp_pending.len(),
                            u.zst_pending.len(),
                            u.last_forwarded
                        )
                    })
                    .collect(),
            ),
            "shaders" => Some(
                self.shaders
                    .iter()
                    .enumerate()
                    .map(|(i, s)| format!("shader {i}: queued {} in flight {} state {:?}\n", s.queue.len(), s.in_flight, s.ready))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let shader = self
            .shaders
            .iter()
            .any(|s| s.progress.stalled(cycle, threshold, s.in_flight > 0 || !s.queue.is_empty()));
        let rop = self.units.iter().any(|u| {
            let cw_pending = if self.early_z { u.shaded.head_ready() } else { !u.test.is_empty() };
            u.zst_progress.stalled(cycle, threshold, !u.zst_pending.is_empty())
                || u.cw_progress.stalled(cycle, threshold, cw_pending)
        });
        let box_pending = self.state == RasterizerState::Drawing && self.stamps.live() > 0;
        StallStatus::checked(shader || rop || self.progress.stalled(cycle, threshold, box_pending))
    }

    fn stall_report(&self, cycle: u64) -> String {
        let mut out = format!("{} stall report for cycle {cycle}\n{}\n", self.name, self.get_state());
        for (i, s) in self.shaders.iter().enumerate() {
            out.push_str(&format!(
                " shader {i}: queued {} in flight {} state {:?} last progress {}\n",
                s.queue.len(),
                s.in_flight,
                s.ready,
                s.progress.last()
            ));
        }
        for (i, u) in self.units.iter().enumerate() {
            out.push_str(&format!(
                " unit {i}: ZST state {:?} pending {} last progress {} | CW state {:?} last progress {}\n",
                u.zst_ready,
                u.zst_pending.len(),
                u.zst_progress.last(),
                u.cw_ready,
                u.cw_progress.last()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rsim_core::primitive::{SetupTriangle, Vertex};
    use rsim_core::{Slot, TriangleId};

    use super::*;

    type Latency = Box<dyn Fn(&ShaderWork) -> u64>;

    struct Bench {
        ff: FragmentFifo,
        ports: FragmentFifoPorts,
        cycle: u64,
        hz_ready: bool,
        latency: Latency,
        shader_work: Vec<Vec<(u64, ShaderWork)>>,
        cull: Box<dyn Fn(&Stamp) -> bool>,
        cw_busy_until: u64,
        cw: Vec<Vec<Stamp>>,
        vertices: Vec<VertexInput>,
        triangles: Vec<TriangleShaderOutput>,
        shader_inputs_seen: usize,
    }

    fn live_stamp(unit: usize, sequence: u64, last: bool) -> Stamp {
        let mut s = Stamp::new(TriangleId(1), 2 * sequence as i32, 0);
        for f in s.fragments.iter_mut() {
            f.inside = true;
            f.culled = false;
        }
        s.unit = unit;
        s.sequence = sequence;
        s.last = last;
        s
    }

    fn sequence_of(w: &ShaderWork) -> u64 {
        match &w.payload {
            ShaderPayload::Fragment(s) => s.sequence,
            ShaderPayload::Vertex(v) => v.index as u64,
            ShaderPayload::Triangle(t) => t.triangle.index as u64,
        }
    }

    impl Bench {
        fn new(cfg: RasterizerConfig) -> Self {
            let ports = FragmentFifoPorts::new(&cfg);
            let units = cfg.num_stamp_units;
            let shaders = cfg.fragment_fifo.num_shaders;
            let mut b = Self {
                ff: FragmentFifo::new("FragmentFIFO", cfg.fragment_fifo.clone(), ports.clone(), cfg.layout()),
                ports,
                cycle: 0,
                hz_ready: false,
                latency: Box::new(|_| 3),
                shader_work: vec![Vec::new(); shaders],
                cull: Box::new(|_| false),
                cw_busy_until: 0,
                cw: vec![Vec::new(); units],
                vertices: Vec::new(),
                triangles: Vec::new(),
                shader_inputs_seen: 0,
            };
            b.step();
            b
        }

        fn step(&mut self) {
            let c = self.cycle;
            self.ports.interpolator_state.write(c, UnitState::Ready);
            for s in &self.ports.zst_state {
                s.write(c, UnitState::Ready);
            }
            let cw = if c < self.cw_busy_until { UnitState::Busy } else { UnitState::Ready };
            for s in &self.ports.cw_state {
                s.write(c, cw);
            }
            for s in &self.ports.shader_state {
                s.write(c, UnitState::Ready);
            }

            self.ff.clock(c);

            if let Some(s) = self.ports.hz_state.read_latest(c) {
                self.hz_ready = s.accepts();
            }
            for stamp in self.ports.interpolator_output.read_up_to(c, usize::MAX) {
                self.ports.interpolator_input.write(c, stamp);
            }
            for u in 0..self.ports.zst_output.len() {
                for mut stamp in self.ports.zst_output[u].read_up_to(c, usize::MAX) {
                    if !stamp.marker && (self.cull)(&stamp) {
                        for f in stamp.fragments.iter_mut() {
                            f.culled = true;
                        }
                    }
                    self.ports.zst_input[u].write(c, stamp);
                }
                self.cw[u].extend(self.ports.cw_output[u].read_up_to(c, usize::MAX));
            }
            for s in 0..self.shader_work.len() {
                for w in self.ports.shader_input[s].read_up_to(c, usize::MAX) {
                    self.shader_inputs_seen += 1;
                    let ready = c + (self.latency)(&w);
                    self.shader_work[s].push((ready, w));
                }
                let due = self.shader_work[s]
                    .iter()
                    .enumerate()
                    .filter(|(_, (r, _))| *r <= c)
                    .min_by_key(|(_, (r, _))| *r)
                    .map(|(i, _)| i);
                if let Some(i) = due {
                    let (_, w) = self.shader_work[s].remove(i);
                    self.ports.shader_output[s].write(c, w);
                }
            }
            self.vertices.extend(self.ports.vertex_output.read_up_to(c, usize::MAX));
            self.triangles.extend(self.ports.triangle_output.read_up_to(c, usize::MAX));
            self.cycle += 1;
        }

        fn command(&mut self, c: RasterizerCommand) {
            self.ports.command.write(self.cycle, c);
            self.step();
            self.step();
        }

        /// Run a draw to completion feeding `stamps` as HZ would.
        fn draw(&mut self, stamps: Vec<Stamp>) {
            self.command(RasterizerCommand::Draw);
            let mut input: VecDeque<Stamp> = stamps.into();
            let rate = self.ports.hz_input.bandwidth();
            let mut guard = 0;
            while self.ff.state() != RasterizerState::End {
                if self.hz_ready {
                    for _ in 0..rate {
                        if let Some(s) = input.pop_front() {
                            self.ports.hz_input.write(self.cycle, s);
                        }
                    }
                }
                self.step();
                guard += 1;
                assert!(guard < 5000, "draw never finished: {}", self.ff.get_state());
            }
            assert!(input.is_empty());
            self.command(RasterizerCommand::End);
        }
    }

    fn config(units: usize) -> RasterizerConfig {
        RasterizerConfig {
            num_stamp_units: units,
            ..RasterizerConfig::default()
        }
    }

    fn cw_sequences(b: &Bench, u: usize) -> Vec<u64> {
        b.cw[u].iter().filter(|s| !s.marker).map(|s| s.sequence).collect()
    }

    #[test]
    fn late_z_restores_shading_order() {
        let mut b = Bench::new(config(1));
        b.latency = Box::new(|w| 30 - 5 * (sequence_of(w) % 5));
        b.command(RasterizerCommand::write(GpuRegister::EarlyZ, 0, GpuRegData::Bool(false)));
        let stamps = (0..12).map(|i| live_stamp(0, i, i == 11)).collect();
        b.draw(stamps);
        assert!(!b.ff.early_z());
        assert_eq!(cw_sequences(&b, 0), (0..12).collect::<Vec<_>>());
        assert_eq!(b.ff.statistics().get("outputs_zst"), 12);
        assert_eq!(b.ff.statistics().get("outputs_cw"), 12);
        assert_eq!(b.ff.statistics().get("shader_outputs"), 12);
    }

    #[test]
    fn early_z_culls_before_shading() {
        let mut b = Bench::new(config(1));
        b.cull = Box::new(|s| s.sequence % 2 == 0 && !s.last);
        let stamps = (0..10).map(|i| live_stamp(0, i, i == 9)).collect();
        b.draw(stamps);
        assert!(b.ff.early_z());
        assert_eq!(cw_sequences(&b, 0), vec![1, 3, 5, 7, 9]);
        assert_eq!(b.shader_inputs_seen, 5);
        assert_eq!(b.ff.statistics().get("culled"), 5);
    }

    #[test]
    fn culled_last_stamp_reaches_color_write_as_marker() {
        let mut b = Bench::new(config(1));
        b.cull = Box::new(|_| true);
        b.draw(vec![live_stamp(0, 0, false), live_stamp(0, 1, true)]);
        assert_eq!(b.cw[0].len(), 1);
        assert!(b.cw[0][0].marker && b.cw[0][0].last);
        assert_eq!(b.shader_inputs_seen, 0);
    }

    #[test]
    fn modify_depth_forces_late_z() {
        let mut b = Bench::new(config(1));
        b.command(RasterizerCommand::write(GpuRegister::ModifyFragmentDepth, 0, GpuRegData::Bool(true)));
        b.draw(vec![live_stamp(0, 0, true)]);
        assert!(!b.ff.early_z());
        assert_eq!(cw_sequences(&b, 0), vec![0]);
    }

    #[test]
    fn draw_ends_after_every_unit_forwards_its_last() {
        let mut b = Bench::new(config(2));
        let mut stamps = Vec::new();
        for i in 0..6 {
            stamps.push(live_stamp(0, i, i == 5));
        }
        stamps.push(Stamp::end_marker(1, 6));
        b.draw(stamps);
        assert_eq!(cw_sequences(&b, 0).len(), 6);
        assert_eq!(b.cw[1].len(), 1);
        assert!(b.cw[1][0].marker);
        assert_eq!(b.ff.state(), RasterizerState::Ready);
    }

    #[test]
    fn busy_color_write_backs_up_without_loss() {
        let mut cfg = config(1);
        cfg.fragment_fifo.rast_queue_size = 4;
        cfg.fragment_fifo.test_queue_size = 4;
        cfg.fragment_fifo.int_queue_size = 4;
        cfg.fragment_fifo.shaded_queue_size = 4;
        let mut b = Bench::new(cfg);
        b.cw_busy_until = 300;
        b.command(RasterizerCommand::Draw);
        let mut input: VecDeque<Stamp> = (0..40).map(|i| live_stamp(0, i, i == 39)).collect();
        let mut saw_busy = false;
        while b.ff.state() != RasterizerState::End {
            if b.hz_ready {
                for _ in 0..2 {
                    if let Some(s) = input.pop_front() {
                        b.ports.hz_input.write(b.cycle, s);
                    }
                }
            } else if b.cycle > 10 {
                saw_busy = true;
            }
            b.step();
            assert!(b.cycle < 5000);
        }
        assert!(saw_busy);
        assert_eq!(cw_sequences(&b, 0), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn vertices_commit_in_order() {
        let mut cfg = config(1);
        cfg.fragment_fifo.thread_group = 4;
        let mut b = Bench::new(cfg);
        b.latency = Box::new(|w| 20 - 3 * sequence_of(w));
        for i in 0..6u32 {
            b.ports.vertex_input.write(b.cycle, VertexInput {
                index: i,
                vertex: Vertex::at(i as f32, 0.0, 0.5),
                last: i == 5,
            });
            b.step();
        }
        for _ in 0..100 {
            b.step();
        }
        let order: Vec<u32> = b.vertices.iter().map(|v| v.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(b.ff.statistics().get("vertices"), 6);
    }

    #[test]
    fn partial_vertex_group_waits_for_timeout() {
        let mut cfg = config(1);
        cfg.fragment_fifo.thread_group = 4;
        cfg.fragment_fifo.vertex_group_timeout = 20;
        let mut b = Bench::new(cfg);
        for i in 0..2u32 {
            b.ports.vertex_input.write(b.cycle, VertexInput {
                index: i,
                vertex: Vertex::at(0.0, 0.0, 0.0),
                last: false,
            });
            b.step();
        }
        for _ in 0..10 {
            b.step();
        }
        assert_eq!(b.shader_inputs_seen, 0);
        for _ in 0..40 {
            b.step();
        }
        assert_eq!(b.shader_inputs_seen, 2);
        assert_eq!(b.vertices.len(), 2);
    }

    #[test]
    fn triangles_return_in_submission_order() {
        let mut b = Bench::new(config(1));
        b.latency = Box::new(|w| 15 - 2 * sequence_of(w));
        for i in 0..5u32 {
            let triangle = SetupTriangle {
                id: Some(TriangleId(i)),
                index: i,
                area: 10.0,
                culled: false,
                last: i == 4,
            };
            let entry = Slot { index: i as usize, sequence: i as u64 };
            b.ports.triangle_input.write(b.cycle, TriangleShaderInput { entry, triangle });
            b.step();
        }
        for _ in 0..60 {
            b.step();
        }
        let order: Vec<u32> = b.triangles.iter().map(|t| t.triangle.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tiled_distribution_pins_blocks_to_shaders() {
        let mut cfg = config(1);
        cfg.fragment_fifo.tiled_distribution = true;
        let mut b = Bench::new(cfg);
        // Stamps 0..3 share block 0, stamps 4..7 are in block 1.
        b.draw((0..8).map(|i| live_stamp(0, i, i == 7)).collect());
        let stats = b.ff.statistics();
        assert_eq!(stats.get("shader_outputs"), 8);
        assert_eq!(cw_sequences(&b, 0), (0..8).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "not supported in state RAST_DRAWING")]
    fn register_write_while_drawing_panics() {
        let mut b = Bench::new(config(1));
        b.command(RasterizerCommand::Draw);
        b.command(RasterizerCommand::write(GpuRegister::EarlyZ, 0, GpuRegData::Bool(false)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn any_shader_latencies_keep_unit_order(
            latencies in proptest::collection::vec(1u64..40, 16),
            early in any::<bool>(),
        ) {
            let mut b = Bench::new(config(2));
            let table = latencies.clone();
            b.latency = Box::new(move |w| table[sequence_of(w) as usize % table.len()]);
            b.command(RasterizerCommand::write(GpuRegister::EarlyZ, 0, GpuRegData::Bool(early)));
            let stamps: Vec<Stamp> = (0..16u64)
                .map(|i| live_stamp((i % 2) as usize, i, i >= 14))
                .collect();
            b.draw(stamps);
            prop_assert_eq!(cw_sequences(&b, 0), vec![0, 2, 4, 6, 8, 10, 12, 14]);
            prop_assert_eq!(cw_sequences(&b, 1), vec![1, 3, 5, 7, 9, 11, 13, 15]);
        }
    }
}
