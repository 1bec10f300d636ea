//! The Rasterizer box: owns and wires the stage boxes, routes commands and
//! register writes to them and tracks their completion.
//!
//! Stage boxes only talk through signals. The Rasterizer builds those
//! signals once, hands each pair of neighbours the same handles, and
//! exposes the remaining ends (primitive input, vertex traffic, shader
//! units, color write) in [`RasterizerPorts`].

use std::path::Path;

use image::{GrayImage, ImageFormat, Luma};
use rsim_core::command::unsupported;
use rsim_core::primitive::{SetupInput, ShaderWork, VertexInput};
use rsim_core::stage::ProgressMonitor;
use rsim_core::{
    GpuRegData, GpuRegister, PipelineStage, PixelMapper, RasterizerCommand, RasterizerConfig,
    RasterizerState, Result, Signal, SimError, Stamp, StallStatus, Statistics, UnitState,
};
use rsim_emulator::{RasterizerEmulator, SharedEmulator};
use rsim_fragment_fifo::{FragmentFifo, FragmentFifoPorts};
use rsim_hierarchical_z::{HierarchicalZ, HierarchicalZPorts};
use rsim_interpolator::{Interpolator, InterpolatorPorts};
use rsim_triangle_setup::{TriangleSetup, TriangleSetupPorts};
use rsim_triangle_traversal::{TriangleTraversal, TriangleTraversalPorts};
use rsim_zstencil::memory::{depth_of, stencil_of};
use rsim_zstencil::{ZStencilPorts, ZStencilTest};

const MAX_RENDER_TARGETS: usize = 8;

/// Ends of the pipeline signals that leave the Rasterizer.
#[derive(Debug, Clone)]
pub struct RasterizerPorts {
    /// Commands from the Command Processor.
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Triangles from primitive assembly.
    pub setup_input: Signal<SetupInput>,
    /// Triangles TriangleSetup asks primitive assembly for.
    pub setup_request: Signal<u32>,
    pub vertex_input: Signal<VertexInput>,
    pub vertex_state: Signal<UnitState>,
    pub vertex_output: Signal<VertexInput>,
    pub shader_input: Vec<Signal<ShaderWork>>,
    pub shader_state: Vec<Signal<UnitState>>,
    pub shader_output: Vec<Signal<ShaderWork>>,
    pub color_write: Vec<Signal<Stamp>>,
    pub color_write_state: Vec<Signal<UnitState>>,
}

/// A box owned by the Rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Setup,
    Traversal,
    HierarchicalZ,
    Interpolator,
    FragmentFifo,
    ZStencil(usize),
}

impl Unit {
    fn slot(self) -> usize {
        match self {
            Unit::Setup => 0,
            Unit::Traversal => 1,
            Unit::HierarchicalZ => 2,
            Unit::Interpolator => 3,
            Unit::FragmentFifo => 4,
            Unit::ZStencil(u) => 5 + u,
        }
    }
}

pub struct Rasterizer {
    name: String,
    cfg: RasterizerConfig,
    ports: RasterizerPorts,
    emu: SharedEmulator,
    mapper: PixelMapper,
    state: RasterizerState,

    setup: TriangleSetup,
    traversal: TriangleTraversal,
    hz: HierarchicalZ,
    interpolator: Interpolator,
    fragment_fifo: FragmentFifo,
    zstencil: Vec<ZStencilTest>,

    /// Last state reported by each box, by [`Unit::slot`].
    unit_states: Vec<RasterizerState>,
    /// Boxes working on the current command.
    participants: Vec<Unit>,
    drawing: bool,

    hres: u32,
    vres: u32,
    hz_enabled: bool,
    early_z: bool,
    render_targets: [bool; MAX_RENDER_TARGETS],

    stats: Statistics,
    progress: ProgressMonitor,
}

impl Rasterizer {
    /// Build and wire every stage box for `cfg`.
    pub fn new(cfg: RasterizerConfig, emu: SharedEmulator) -> Result<Self> {
        cfg.validate()?;
        let layout = cfg.layout();
        let mapper = cfg.pixel_mapper();
        let units = cfg.num_stamp_units;

        let ff_ports = FragmentFifoPorts::new(&cfg);

        let zst_ports: Vec<ZStencilPorts> = (0..units)
            .map(|u| {
                let mut p = ZStencilPorts::new(&cfg.zstencil, u);
                p.input = ff_ports.zst_output[u].clone();
                p.input_state = ff_ports.zst_state[u].clone();
                p.output = ff_ports.zst_input[u].clone();
                p.output_state = ff_ports.zst_input_state[u].clone();
                p
            })
            .collect();

        let mut ts_ports = TriangleSetupPorts::new(&cfg.setup);
        ts_ports.shader_input = ff_ports.triangle_input.clone();
        ts_ports.shader_output = ff_ports.triangle_output.clone();
        ts_ports.shader_state = ff_ports.triangle_state.clone();

        let tt_ports = TriangleTraversalPorts::new(&cfg.traversal, ts_ports.output_request.clone(), ts_ports.output.clone());

        let updates = zst_ports.iter().map(|p| p.hz_update.clone()).collect();
        let mut hz_ports = HierarchicalZPorts::new(&cfg.hz, tt_ports.output.clone(), tt_ports.hz_state.clone(), updates);
        hz_ports.output = ff_ports.hz_input.clone();
        hz_ports.output_state = ff_ports.hz_state.clone();

        let mut int_ports = InterpolatorPorts::new(&cfg.interpolator);
        int_ports.input = ff_ports.interpolator_output.clone();
        int_ports.input_state = ff_ports.interpolator_state.clone();
        int_ports.output = ff_ports.interpolator_input.clone();

        let ports = RasterizerPorts {
            command: Signal::state("CommandProcessorToRasterizer"),
            state: Signal::state("RasterizerState"),
            setup_input: ts_ports.input.clone(),
            setup_request: ts_ports.input_request.clone(),
            vertex_input: ff_ports.vertex_input.clone(),
            vertex_state: ff_ports.vertex_state.clone(),
            vertex_output: ff_ports.vertex_output.clone(),
            shader_input: ff_ports.shader_input.clone(),
            shader_state: ff_ports.shader_state.clone(),
            shader_output: ff_ports.shader_output.clone(),
            color_write: ff_ports.cw_output.clone(),
            color_write_state: ff_ports.cw_state.clone(),
        };

        let zstencil = zst_ports
            .into_iter()
            .enumerate()
            .map(|(u, p)| {
                ZStencilTest::new(
                    format!("ZStencilTest{u}"),
                    cfg.zstencil.clone(),
                    p,
                    mapper,
                    u,
                    cfg.state_dir.clone(),
                    cfg.dump_dir.clone(),
                )
            })
            .collect();

        Ok(Self {
            name: "Rasterizer".to_string(),
            setup: TriangleSetup::new("TriangleSetup", cfg.setup.clone(), ts_ports, emu.clone()),
            traversal: TriangleTraversal::new("TriangleTraversal", cfg.traversal.clone(), tt_ports, emu.clone(), mapper),
            hz: HierarchicalZ::new("HierarchicalZ", cfg.hz.clone(), hz_ports, layout, units, cfg.state_dir.clone()),
            interpolator: Interpolator::new("Interpolator", cfg.interpolator.clone(), int_ports, emu.clone(), units),
            fragment_fifo: FragmentFifo::new("FragmentFIFO", cfg.fragment_fifo.clone(), ff_ports, layout),
            zstencil,
            unit_states: vec![RasterizerState::Reset; 5 + units],
            participants: Vec::new(),
            drawing: false,
            hres: cfg.width,
            vres: cfg.height,
            hz_enabled: false,
            early_z: true,
            render_targets: Self::default_render_targets(),
            ports,
            emu,
            mapper,
            cfg,
            state: RasterizerState::Reset,
            stats: Statistics::with_counters(&["commands", "register_writes", "draws", "clears", "cycles_drawing"]),
            progress: ProgressMonitor::default(),
        })
    }

    fn default_render_targets() -> [bool; MAX_RENDER_TARGETS] {
        let mut rt = [false; MAX_RENDER_TARGETS];
        rt[0] = true;
        rt
    }

    pub fn ports(&self) -> &RasterizerPorts {
        &self.ports
    }

    pub fn config(&self) -> &RasterizerConfig {
        &self.cfg
    }

    pub fn setup(&self) -> &TriangleSetup {
        &self.setup
    }

    pub fn traversal(&self) -> &TriangleTraversal {
        &self.traversal
    }

    pub fn hierarchical_z(&self) -> &HierarchicalZ {
        &self.hz
    }

    pub fn hierarchical_z_mut(&mut self) -> &mut HierarchicalZ {
        &mut self.hz
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.interpolator
    }

    pub fn fragment_fifo(&self) -> &FragmentFifo {
        &self.fragment_fifo
    }

    pub fn zstencil(&self, unit: usize) -> &ZStencilTest {
        &self.zstencil[unit]
    }

    pub fn zstencil_mut(&mut self, unit: usize) -> &mut ZStencilTest {
        &mut self.zstencil[unit]
    }

    pub fn render_target_enabled(&self, target: usize) -> bool {
        self.render_targets.get(target).copied().unwrap_or(false)
    }

    pub fn units(&self) -> Vec<Unit> {
        let mut units = vec![
            Unit::Setup,
            Unit::Traversal,
            Unit::HierarchicalZ,
            Unit::Interpolator,
            Unit::FragmentFifo,
        ];
        units.extend((0..self.zstencil.len()).map(Unit::ZStencil));
        units
    }

    pub fn stage(&self, unit: Unit) -> &dyn PipelineStage {
        match unit {
            Unit::Setup => &self.setup,
            Unit::Traversal => &self.traversal,
            Unit::HierarchicalZ => &self.hz,
            Unit::Interpolator => &self.interpolator,
            Unit::FragmentFifo => &self.fragment_fifo,
            Unit::ZStencil(u) => &self.zstencil[u],
        }
    }

    fn stage_mut(&mut self, unit: Unit) -> &mut dyn PipelineStage {
        match unit {
            Unit::Setup => &mut self.setup,
            Unit::Traversal => &mut self.traversal,
            Unit::HierarchicalZ => &mut self.hz,
            Unit::Interpolator => &mut self.interpolator,
            Unit::FragmentFifo => &mut self.fragment_fifo,
            Unit::ZStencil(u) => &mut self.zstencil[u],
        }
    }

    fn find_unit(&self, name: &str) -> Option<Unit> {
        self.units()
            .into_iter()
            .find(|&u| self.stage(u).name().eq_ignore_ascii_case(name))
    }

    fn command_port(&self, unit: Unit) -> &Signal<RasterizerCommand> {
        match unit {
            Unit::Setup => &self.setup.ports().command,
            Unit::Traversal => &self.traversal.ports().command,
            Unit::HierarchicalZ => &self.hz.ports().command,
            Unit::Interpolator => &self.interpolator.ports().command,
            Unit::FragmentFifo => &self.fragment_fifo.ports().command,
            Unit::ZStencil(u) => &self.zstencil[u].ports().command,
        }
    }

    fn state_port(&self, unit: Unit) -> &Signal<RasterizerState> {
        match unit {
            Unit::Setup => &self.setup.ports().state,
            Unit::Traversal => &self.traversal.ports().state,
            Unit::HierarchicalZ => &self.hz.ports().state,
            Unit::Interpolator => &self.interpolator.ports().state,
            Unit::FragmentFifo => &self.fragment_fifo.ports().state,
            Unit::ZStencil(u) => &self.zstencil[u].ports().state,
        }
    }

    fn zstencil_units(&self) -> Vec<Unit> {
        (0..self.zstencil.len()).map(Unit::ZStencil).collect()
    }

    /// Boxes that consume `reg`.
    pub fn register_targets(&self, reg: GpuRegister) -> Vec<Unit> {
        use GpuRegister as R;
        let (mut units, rops) = match reg {
            R::Resolution | R::Viewport => (vec![Unit::Setup, Unit::Traversal, Unit::HierarchicalZ], false),
            R::ScissorTest | R::Scissor | R::HierarchicalZ => (vec![Unit::HierarchicalZ], false),
            R::Culling | R::FaceMode | R::TwoSidedLighting => (vec![Unit::Setup], false),
            R::DepthPrecision => (vec![Unit::Setup, Unit::Interpolator], true),
            R::MultisamplingEnable | R::MsaaSamples => (vec![Unit::Traversal, Unit::HierarchicalZ], true),
            R::EarlyZ => (vec![Unit::FragmentFifo], false),
            R::ModifyFragmentDepth => (vec![Unit::HierarchicalZ, Unit::FragmentFifo], false),
            R::DepthTest | R::StencilTest => (vec![Unit::HierarchicalZ, Unit::FragmentFifo], true),
            R::DepthFunction | R::ZBufferClear => (vec![Unit::HierarchicalZ], true),
            R::DepthMask
            | R::StencilFunction
            | R::StencilReference
            | R::StencilTestMask
            | R::StencilUpdateMask
            | R::StencilFail
            | R::DepthFail
            | R::DepthPass
            | R::StencilBufferClear => (Vec::new(), true),
            R::FragmentInputAttributes => (vec![Unit::Interpolator, Unit::FragmentFifo], false),
            R::Interpolation => (vec![Unit::Interpolator], false),
            R::RenderTargetEnable => (Vec::new(), false),
        };
        if rops {
            units.extend(self.zstencil_units());
        }
        units
    }

    fn send(&self, cycle: u64, units: &[Unit], command: &RasterizerCommand) {
        for &u in units {
            self.command_port(u).write(cycle, command.clone());
        }
    }

    /// Forward `command` to `units` and wait in `waiting` until they finish.
    fn start(&mut self, cycle: u64, waiting: RasterizerState, units: Vec<Unit>, command: RasterizerCommand) {
        self.send(cycle, &units, &command);
        self.participants = units;
        self.state = waiting;
    }

    fn reset(&mut self) {
        self.hres = self.cfg.width;
        self.vres = self.cfg.height;
        self.hz_enabled = false;
        self.early_z = true;
        self.render_targets = Self::default_render_targets();
        self.participants.clear();
        self.drawing = false;
    }

    fn process_register_write(&mut self, cycle: u64, reg: GpuRegister, subreg: u32, data: GpuRegData) {
        match reg {
            GpuRegister::Resolution if subreg == 0 => self.hres = data.as_uint(),
            GpuRegister::Resolution => self.vres = data.as_uint(),
            GpuRegister::HierarchicalZ => self.hz_enabled = data.as_bool(),
            GpuRegister::EarlyZ => self.early_z = data.as_bool(),
            GpuRegister::RenderTargetEnable => match self.render_targets.get_mut(subreg as usize) {
                Some(rt) => *rt = data.as_bool(),
                None => panic!("{}: render target {subreg} out of range", self.name),
            },
            _ => {}
        }
        let targets = self.register_targets(reg);
        self.send(cycle, &targets, &RasterizerCommand::RegisterWrite { reg, subreg, data });
        self.stats.inc("register_writes");
    }

    fn process_command(&mut self, cycle: u64, command: RasterizerCommand) {
        log::debug!("{} cycle {cycle}: command {command:?} in {}", self.name, self.state);
        self.stats.inc("commands");
        let all = self.units();
        let rops = self.zstencil_units();
        let mut hz_and_rops = vec![Unit::HierarchicalZ];
        hz_and_rops.extend(rops.iter().copied());

        match (self.state, command) {
            (_, RasterizerCommand::Reset) => {
                self.send(cycle, &all, &RasterizerCommand::Reset);
                self.state = RasterizerState::Reset;
            }
            (RasterizerState::Ready, RasterizerCommand::RegisterWrite { reg, subreg, data }) => {
                self.process_register_write(cycle, reg, subreg, data)
            }
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                log::info!("{} cycle {cycle}: draw {}", self.name, self.stats.get("draws"));
                self.stats.inc("draws");
                self.drawing = true;
                self.start(cycle, RasterizerState::Drawing, all, RasterizerCommand::Draw);
            }
            (RasterizerState::Ready, RasterizerCommand::ClearZStencil) => {
                self.stats.inc("clears");
                self.start(cycle, RasterizerState::Clear, hz_and_rops, RasterizerCommand::ClearZStencil);
            }
            // The color buffer belongs to Color Write.
            (RasterizerState::Ready, RasterizerCommand::ClearColor) => {
                self.start(cycle, RasterizerState::Clear, Vec::new(), RasterizerCommand::ClearColor)
            }
            (RasterizerState::Ready, command @ (RasterizerCommand::Flush | RasterizerCommand::FrameChange)) => {
                self.start(cycle, RasterizerState::Flush, rops, command)
            }
            (RasterizerState::Ready, RasterizerCommand::Swap) => {
                self.start(cycle, RasterizerState::Swap, rops, RasterizerCommand::Swap)
            }
            (RasterizerState::Ready, command @ (RasterizerCommand::DumpDepth | RasterizerCommand::DumpStencil)) => {
                self.start(cycle, RasterizerState::DumpBuffer, rops, command)
            }
            (RasterizerState::Ready, RasterizerCommand::DumpColor) => {
                self.start(cycle, RasterizerState::DumpBuffer, Vec::new(), RasterizerCommand::DumpColor)
            }
            (RasterizerState::Ready, RasterizerCommand::Blit) => {
                self.start(cycle, RasterizerState::Blit, Vec::new(), RasterizerCommand::Blit)
            }
            (RasterizerState::Ready, RasterizerCommand::SaveState) => {
                self.start(cycle, RasterizerState::SaveState, hz_and_rops, RasterizerCommand::SaveState)
            }
            (RasterizerState::Ready, RasterizerCommand::RestoreState) => {
                self.start(cycle, RasterizerState::RestoreState, hz_and_rops, RasterizerCommand::RestoreState)
            }
            (RasterizerState::Ready, RasterizerCommand::ResetState) => {
                self.start(cycle, RasterizerState::ResetState, hz_and_rops, RasterizerCommand::ResetState)
            }
            (RasterizerState::End | RasterizerState::ClearEnd, RasterizerCommand::End) => {
                let participants = std::mem::take(&mut self.participants);
                self.send(cycle, &participants, &RasterizerCommand::End);
                if self.drawing {
                    self.emu.borrow_mut().clear();
                    self.drawing = false;
                }
                self.state = RasterizerState::Ready;
            }
            (state, command) => unsupported(&self.name, state, &command),
        }
    }

    fn participants_finished(&self) -> bool {
        self.participants
            .iter()
            .all(|u| self.unit_states[u.slot()].is_finished())
    }

    /// Stored depth (or stencil) of pixel `(x, y)`, from the unit that owns it.
    pub fn depth_stencil_at(&self, x: i32, y: i32) -> Option<u32> {
        let unit = self.mapper.map_to_unit(x, y);
        self.zstencil.get(unit)?.word_at(x, y)
    }

    /// Depth (top 8 bits) or stencil of the whole screen, merged from every
    /// Z/Stencil unit.
    pub fn depth_image(&self, stencil: bool) -> GrayImage {
        let layout = self.mapper.layout;
        GrayImage::from_fn(layout.width, layout.height, |x, y| {
            let v = match self.depth_stencil_at(x as i32, y as i32) {
                Some(w) if stencil => stencil_of(w),
                Some(w) => (depth_of(w) >> 16) as u8,
                None => 0,
            };
            Luma([v])
        })
    }

    pub fn write_depth_png(&self, path: impl AsRef<Path>, stencil: bool) -> Result<()> {
        self.depth_image(stencil)
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| SimError::Io(std::io::Error::other(e)))
    }

    pub fn save_hz_buffer(&self, path: impl AsRef<Path>) -> Result<()> {
        self.hz.save_hz_buffer(path)
    }

    pub fn load_hz_buffer(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.hz.load_hz_buffer(path)
    }

    /// Counters of the Rasterizer and every box, by box name.
    pub fn all_statistics(&self) -> Vec<(&str, &Statistics)> {
        let mut out = vec![(self.name.as_str(), &self.stats)];
        for u in self.units() {
            let s = self.stage(u);
            out.push((s.name(), s.statistics()));
        }
        out
    }
}

impl PipelineStage for Rasterizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        self.setup.clock(cycle);
        self.traversal.clock(cycle);
        self.hz.clock(cycle);
        self.interpolator.clock(cycle);
        self.fragment_fifo.clock(cycle);
        for z in &mut self.zstencil {
            z.clock(cycle);
        }

        for u in self.units() {
            if let Some(s) = self.state_port(u).read_latest(cycle) {
                self.unit_states[u.slot()] = s;
            }
        }

        match self.state {
            RasterizerState::Reset => {
                self.reset();
                self.state = RasterizerState::Ready;
            }
            RasterizerState::Ready | RasterizerState::End | RasterizerState::ClearEnd => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
            }
            waiting => {
                if waiting == RasterizerState::Drawing {
                    self.stats.inc("cycles_drawing");
                }
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                } else if self.participants_finished() {
                    log::debug!("{} cycle {cycle}: {waiting} finished", self.name);
                    self.state = if waiting == RasterizerState::Clear {
                        RasterizerState::ClearEnd
                    } else {
                        RasterizerState::End
                    };
                    self.progress.note(cycle);
                }
            }
        }

        self.ports.state.write(cycle, self.state);
    }

    fn state(&self) -> RasterizerState {
        self.state
    }

    fn get_state(&self) -> String {
        let boxes: Vec<String> = self
            .units()
            .into_iter()
            .map(|u| format!("{} = {}", self.stage(u).name(), self.unit_states[u.slot()]))
            .collect();
        format!(
            " state = {} | Resolution = {}x{} | HZ = {} | Early Z = {} | {}",
            self.state,
            self.hres,
            self.vres,
            self.hz_enabled,
            self.early_z,
            boxes.join(" | ")
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn command_list(&self) -> Vec<&'static str> {
        vec![
            "boxes - list the rasterizer boxes",
            "box <name> <command> - run a console command in one box",
        ]
    }

    fn exec_box_command(&mut self, command: &str, args: &[&str]) -> Option<String> {
        match command {
            "boxes" => Some(
                self.units()
                    .into_iter()
                    .map(|u| self.stage(u).name().to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            "box" => Some(match args.split_first() {
                Some((name, rest)) => match self.find_unit(name) {
                    Some(u) => self.stage_mut(u).exec_command(&rest.join(" ")),
                    None => format!("{}: no box named '{name}'", self.name),
                },
                None => "usage: box <name> <command>".to_string(),
            }),
            _ => None,
        }
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let stalled = self
            .units()
            .into_iter()
            .any(|u| self.stage(u).detect_stall(cycle, threshold).stalled);
        StallStatus::checked(stalled)
    }

    fn stall_report(&self, cycle: u64) -> String {
        let mut report = format!("{} stall report for cycle {cycle}\n{}\n", self.name, self.get_state());
        let threshold = self.cfg.stall_threshold;
        let stalled: Vec<Unit> = self
            .units()
            .into_iter()
            .filter(|&u| self.stage(u).detect_stall(cycle, threshold).stalled)
            .collect();
        let units = if stalled.is_empty() { self.units() } else { stalled };
        for u in units {
            report.push_str(&self.stage(u).stall_report(cycle));
        }
        report
    }
}
