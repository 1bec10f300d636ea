//! Triangle setup box.
//!
//! Requests triangles from primitive assembly, runs them through the setup
//! units (throughput `start_latency`, depth `latency`), classifies facing,
//! culls, and queues the results in the setup FIFO for traversal. With
//! shader setup enabled the set-up triangles make a round trip through the
//! unified shader and are committed back in submission order.

use std::collections::VecDeque;

use rsim_core::command::unsupported;
use rsim_core::config::SetupConfig;
use rsim_core::primitive::{SetupInput, SetupTriangle, TriangleShaderInput, TriangleShaderOutput};
use rsim_core::stage::ProgressMonitor;
use rsim_core::{
    CullMode, FaceMode, GpuRegData, GpuRegister, PipelineStage, RasterizerCommand,
    RasterizerState, ReorderBuffer, RingQueue, Signal, Slot, StallStatus, Statistics, UnitState,
};
use rsim_emulator::{RasterizerEmulator, Rect, SharedEmulator};

/// Signals connecting the setup box to its neighbours.
#[derive(Debug, Clone)]
pub struct TriangleSetupPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Triangles from primitive assembly.
    pub input: Signal<SetupInput>,
    /// Number of triangles requested from primitive assembly.
    pub input_request: Signal<u32>,
    /// Set-up triangles to traversal.
    pub output: Signal<SetupTriangle>,
    /// Number of triangles traversal can take.
    pub output_request: Signal<u32>,
    pub shader_input: Signal<TriangleShaderInput>,
    pub shader_output: Signal<TriangleShaderOutput>,
    pub shader_state: Signal<UnitState>,
}

impl TriangleSetupPorts {
    /// Fresh signals sized for `cfg`.
    pub fn new(cfg: &SetupConfig) -> Self {
        Self {
            command: Signal::state("RasterizerToTriangleSetup"),
            state: Signal::state("TriangleSetupState"),
            input: Signal::new("PrimitiveAssemblyToSetup", cfg.triangles_cycle, 1),
            input_request: Signal::state("SetupRequestToPrimitiveAssembly"),
            output: Signal::new("SetupToTraversal", cfg.triangles_cycle, 1),
            output_request: Signal::state("TraversalRequestToSetup"),
            shader_input: Signal::new("SetupToFragmentFIFO", cfg.triangles_cycle, 1),
            shader_output: Signal::new("FragmentFIFOToSetup", cfg.triangles_cycle, 1),
            shader_state: Signal::state("FragmentFIFOTriangleState"),
        }
    }
}

/// Triangles grouped by absolute area in pixels.
const SIZE_BUCKETS: [(&str, f64); 6] = [
    ("size_less_1", 1.0),
    ("size_1_to_4", 4.0),
    ("size_4_to_16", 16.0),
    ("size_16_to_100", 100.0),
    ("size_100_to_1000", 1000.0),
    ("size_1000_to_screen", f64::INFINITY),
];

pub struct TriangleSetup {
    name: String,
    cfg: SetupConfig,
    ports: TriangleSetupPorts,
    emu: SharedEmulator,
    state: RasterizerState,

    hres: u32,
    vres: u32,
    /// Viewport restored on reset: the emulator's at construction.
    default_viewport: Rect,
    viewport: Rect,
    culling: CullMode,
    face_mode: FaceMode,
    two_sided: bool,
    depth_bits: u32,

    /// Setup unit pipeline.
    setup_pipe: Signal<SetupTriangle>,
    fifo: RingQueue<SetupTriangle>,
    /// Requested from primitive assembly, not yet received.
    outstanding: usize,
    /// Received, not yet in the FIFO.
    in_setup: usize,
    setup_wait: u32,
    /// Triangles traversal asked for.
    requested: u32,
    last_received: bool,
    shader_queue: ReorderBuffer<SetupTriangle>,
    shader_pending: VecDeque<(Slot, SetupTriangle)>,
    shader_ready: UnitState,
    triangle_counter: u64,

    stats: Statistics,
    progress: ProgressMonitor,
}

impl TriangleSetup {
    pub fn new(name: impl Into<String>, cfg: SetupConfig, ports: TriangleSetupPorts, emu: SharedEmulator) -> Self {
        let viewport = emu.borrow().viewport();
        Self {
            name: name.into(),
            setup_pipe: Signal::new("SetupPipeline", cfg.setup_units, cfg.latency),
            fifo: RingQueue::new("setup FIFO", cfg.fifo_size),
            shader_queue: ReorderBuffer::new("setup shader queue", cfg.shader_queue_size),
            cfg,
            ports,
            emu,
            state: RasterizerState::Reset,
            hres: viewport.x1 as u32,
            vres: viewport.y1 as u32,
            default_viewport: viewport,
            viewport,
            culling: CullMode::None,
            face_mode: FaceMode::Ccw,
            two_sided: false,
            depth_bits: 24,
            outstanding: 0,
            in_setup: 0,
            setup_wait: 0,
            requested: 0,
            last_received: false,
            shader_pending: VecDeque::new(),
            shader_ready: UnitState::Busy,
            triangle_counter: 0,
            stats: Statistics::with_counters(&[
                "inputs", "outputs", "requests", "culled", "front", "back", "size_less_1",
                "size_1_to_4", "size_4_to_16", "size_16_to_100", "size_100_to_1000",
                "size_1000_to_screen", "size_greater_screen",
            ]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &TriangleSetupPorts {
        &self.ports
    }

    fn reset_registers(&mut self) {
        self.viewport = self.default_viewport;
        self.hres = self.viewport.x1 as u32;
        self.vres = self.viewport.y1 as u32;
        self.culling = CullMode::None;
        self.face_mode = FaceMode::Ccw;
        self.two_sided = false;
        self.depth_bits = 24;
        let mut emu = self.emu.borrow_mut();
        emu.set_viewport(self.viewport);
        emu.set_depth_precision(self.depth_bits);
    }

    fn reset_pipeline(&mut self) {
        self.fifo.clear();
        self.setup_pipe.clear();
        self.shader_queue.clear();
        self.shader_pending.clear();
        self.outstanding = 0;
        self.in_setup = 0;
        self.setup_wait = 0;
        self.requested = 0;
        self.last_received = false;
    }

    fn process_command(&mut self, cycle: u64, command: RasterizerCommand) {
        log::debug!("{} cycle {cycle}: command {command:?} in {}", self.name, self.state);
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                self.reset_pipeline();
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
            GpuRegister::Resolution => match subreg {
                0 => self.hres = data.as_uint(),
                _ => self.vres = data.as_uint(),
            },
            GpuRegister::Viewport => {
                let v = &mut self.viewport;
                let (w, h) = ((v.x1 - v.x0) as u32, (v.y1 - v.y0) as u32);
                *v = match subreg {
                    0 => Rect::new(data.as_int(), v.y0, w, h),
                    1 => Rect::new(v.x0, data.as_int(), w, h),
                    2 => Rect::new(v.x0, v.y0, data.as_uint(), h),
                    _ => Rect::new(v.x0, v.y0, w, data.as_uint()),
                };
                self.emu.borrow_mut().set_viewport(self.viewport);
            }
            GpuRegister::Culling => self.culling = data.as_cull(),
            GpuRegister::FaceMode => self.face_mode = data.as_face(),
            GpuRegister::TwoSidedLighting => self.two_sided = data.as_bool(),
            GpuRegister::DepthPrecision => {
                self.depth_bits = data.as_uint();
                self.emu.borrow_mut().set_depth_precision(self.depth_bits);
            }
            other => panic!("{}: unsupported register {other:?}", self.name),
        }
    }

    /// Ask primitive assembly for as many triangles as the FIFO can absorb.
    fn request_inputs(&mut self, cycle: u64) {
        if self.last_received {
            return;
        }
        let committed = self.fifo.len() + self.outstanding + self.in_setup;
        let limit = if self.cfg.shader_setup {
            self.cfg.fifo_size.min(self.cfg.shader_queue_size)
        } else {
            self.cfg.fifo_size
        };
        let room = limit.saturating_sub(committed);
        let n = room.min(self.cfg.triangles_cycle as usize);
        if n > 0 {
            self.ports.input_request.write(cycle, n as u32);
            self.outstanding += n;
            self.stats.add("requests", n as u64);
        }
    }

    /// Feed received triangles to the setup units.
    fn start_setup(&mut self, cycle: u64) {
        if self.setup_wait > 0 {
            self.setup_wait -= 1;
            return;
        }
        let mut started = 0;
        while started < self.cfg.setup_units && !self.last_received {
            let Some(input) = self.ports.input.read(cycle) else {
                break;
            };
            self.outstanding = self.outstanding.saturating_sub(1);
            self.in_setup += 1;
            started += 1;
            self.progress.note(cycle);
            let triangle = match input.vertices {
                Some(vertices) => {
                    self.stats.inc("inputs");
                    self.triangle_counter += 1;
                    let id = self.emu.borrow_mut().setup_triangle(&vertices);
                    SetupTriangle {
                        id: Some(id),
                        index: input.index,
                        area: 0.0,
                        culled: false,
                        last: input.last,
                    }
                }
                None => SetupTriangle::end_marker(input.index),
            };
            if triangle.last {
                self.last_received = true;
                self.outstanding = 0;
            }
            log::trace!("{} cycle {cycle}: setup start triangle {}", self.name, triangle.index);
            self.setup_pipe.write(cycle, triangle);
        }
        if started > 0 {
            self.setup_wait = self.cfg.start_latency - 1;
        }
    }

    /// Facing classification, culling, inversion and color selection.
    fn finalize(&mut self, mut triangle: SetupTriangle) -> SetupTriangle {
        let Some(id) = triangle.id else {
            return triangle;
        };
        let raw = self.emu.borrow().triangle_area(id);
        let facing = match self.face_mode {
            FaceMode::Ccw => raw,
            FaceMode::Cw => -raw,
        };
        let back = facing < 0.0;
        let culled = facing == 0.0
            || match self.culling {
                CullMode::None => false,
                CullMode::Front => !back,
                CullMode::Back => back,
                CullMode::FrontAndBack => true,
            };

        self.stats.inc(if back { "back" } else { "front" });
        let size = raw.abs();
        let screen = (self.hres as f64) * (self.vres as f64);
        let bucket = if size > screen {
            "size_greater_screen"
        } else {
            SIZE_BUCKETS
                .iter()
                .find(|(_, limit)| size < *limit)
                .map(|(name, _)| *name)
                .unwrap_or("size_1000_to_screen")
        };
        self.stats.inc(bucket);

        if culled {
            self.stats.inc("culled");
            self.emu.borrow_mut().destroy_triangle(id);
        } else {
            let mut emu = self.emu.borrow_mut();
            if raw < 0.0 {
                emu.invert_triangle(id);
            }
            if back && self.two_sided {
                emu.select_back_color(id);
            }
        }
        triangle.area = size;
        triangle.culled = culled;
        triangle
    }

    fn push_fifo(&mut self, triangle: SetupTriangle) {
        self.in_setup -= 1;
        self.fifo.push(triangle);
    }

    fn end_setup(&mut self, cycle: u64) {
        while let Some(triangle) = self.setup_pipe.read(cycle) {
            if !self.cfg.shader_setup {
                let t = self.finalize(triangle);
                self.push_fifo(t);
            } else if triangle.id.is_none() {
                let slot = self.shader_queue.reserve(triangle);
                self.shader_queue.complete(slot, None);
            } else {
                let slot = self.shader_queue.reserve(triangle.clone());
                self.shader_pending.push_back((slot, triangle));
            }
        }
    }

    /// Round trip through the unified shader, committed in order.
    fn shader_setup(&mut self, cycle: u64) {
        let mut sent = 0;
        while sent < self.cfg.triangles_cycle && self.shader_ready.accepts() {
            let Some((entry, triangle)) = self.shader_pending.pop_front() else {
                break;
            };
            self.ports
                .shader_input
                .write(cycle, TriangleShaderInput { entry, triangle });
            sent += 1;
        }

        while let Some(out) = self.ports.shader_output.read(cycle) {
            self.shader_queue.complete(out.entry, Some(out.triangle));
            self.progress.note(cycle);
        }

        let mut committed = 0;
        while committed < self.cfg.triangles_cycle {
            let Some(triangle) = self.shader_queue.pop_ready() else {
                break;
            };
            let t = self.finalize(triangle);
            self.push_fifo(t);
            committed += 1;
        }
    }

    fn send_triangles(&mut self, cycle: u64) {
        if let Some(n) = self.ports.output_request.read(cycle) {
            self.requested += n;
        }
        let mut sent = 0;
        while sent < self.cfg.triangles_cycle && self.requested > 0 {
            let Some(triangle) = self.fifo.pop() else {
                break;
            };
            self.requested -= 1;
            sent += 1;
            self.progress.note(cycle);
            if !triangle.culled {
                self.stats.inc("outputs");
            }
            let last = triangle.last;
            self.ports.output.write(cycle, triangle);
            if last {
                log::debug!("{} cycle {cycle}: last triangle sent", self.name);
                self.state = RasterizerState::End;
                break;
            }
        }
    }

    fn draw_cycle(&mut self, cycle: u64) {
        self.send_triangles(cycle);
        if self.state != RasterizerState::Drawing {
            return;
        }
        if self.cfg.shader_setup {
            self.shader_setup(cycle);
        }
        self.end_setup(cycle);
        self.start_setup(cycle);
        self.request_inputs(cycle);
    }
}

impl PipelineStage for TriangleSetup {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        if let Some(s) = self.ports.shader_state.read_latest(cycle) {
            self.shader_ready = s;
        }
        match self.state {
            RasterizerState::Reset => {
                self.reset_registers();
                self.reset_pipeline();
                self.state = RasterizerState::Ready;
            }
            RasterizerState::Ready | RasterizerState::End => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
            }
            RasterizerState::Drawing => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
                if self.state == RasterizerState::Drawing {
                    self.draw_cycle(cycle);
                }
            }
            other => panic!("{}: unsupported state {other}", self.name),
        }
        self.ports.state.write(cycle, self.state);
    }

    fn state(&self) -> RasterizerState {
        self.state
    }

    fn get_state(&self) -> String {
        format!(
            " state = {} | Triangle Counter = {} | Setup FIFO = {} | Outstanding = {} | In Setup = {} | Requested = {}",
            self.state,
            self.triangle_counter,
            self.fifo.len(),
            self.outstanding,
            self.in_setup,
            self.requested
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn command_list(&self) -> Vec<&'static str> {
        vec!["fifo - list triangles waiting in the setup FIFO"]
    }

    fn exec_box_command(&mut self, command: &str, _args: &[&str]) -> Option<String> {
        match command {
            "fifo" => Some(
                self.fifo
                    .iter()
                    .map(|t| format!("triangle {} culled={} last={}\n", t.index, t.culled, t.last))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let pending = self.state == RasterizerState::Drawing
            && (!self.fifo.is_empty() || self.in_setup > 0 || !self.shader_queue.is_empty());
        StallStatus::checked(self.progress.stalled(cycle, threshold, pending))
    }

    fn stall_report(&self, cycle: u64) -> String {
        format!(
            "{} stall report for cycle {cycle}\n{}\n shader queue = {} (outstanding {}) | pending shader sends = {} | shader state = {:?}\n",
            self.name,
            self.get_state(),
            self.shader_queue.len(),
            self.shader_queue.outstanding(),
            self.shader_pending.len(),
            self.shader_ready
        )
    }
}
