//! Triangle traversal box.
//!
//! Pulls set-up triangles from TriangleSetup into a local queue, walks them
//! into stamps with the configured [`Walker`](walker::Walker) and sends the
//! stamps to Hierarchical Z. Each stamp is assigned to the stamp unit that
//! owns its screen block. At the end of the draw the final stamp carries
//! the last flag and every other stamp unit receives an end marker, so each
//! unit lane observes exactly one last stamp.

use std::collections::VecDeque;

use rsim_core::command::unsupported;
use rsim_core::config::TraversalConfig;
use rsim_core::primitive::SetupTriangle;
use rsim_core::stage::ProgressMonitor;
use rsim_core::{
    GpuRegData, GpuRegister, PipelineStage, PixelMapper, RasterizerCommand, RasterizerState,
    RingQueue, Signal, Stamp, StallStatus, Statistics, TriangleId, UnitState,
};
use rsim_emulator::SharedEmulator;

pub mod walker;

use walker::{walker_for, Walker};

#[derive(Debug, Clone)]
pub struct TriangleTraversalPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Triangle requests to TriangleSetup.
    pub request: Signal<u32>,
    /// Set-up triangles from TriangleSetup.
    pub input: Signal<SetupTriangle>,
    /// Stamps to Hierarchical Z.
    pub output: Signal<Stamp>,
    pub hz_state: Signal<UnitState>,
}

impl TriangleTraversalPorts {
    /// `request` and `input` are the setup box's output side.
    pub fn new(cfg: &TraversalConfig, request: Signal<u32>, input: Signal<SetupTriangle>) -> Self {
        Self {
            command: Signal::state("RasterizerToTraversal"),
            state: Signal::state("TraversalState"),
            request,
            input,
            output: Signal::new("TraversalToHierarchicalZ", cfg.stamps_cycle, 1),
            hz_state: Signal::state("HierarchicalZToTraversalState"),
        }
    }
}

pub struct TriangleTraversal {
    name: String,
    cfg: TraversalConfig,
    ports: TriangleTraversalPorts,
    emu: SharedEmulator,
    mapper: PixelMapper,
    state: RasterizerState,

    msaa_enabled: bool,
    msaa_samples: usize,

    triangles: RingQueue<SetupTriangle>,
    requested: u32,
    last_received: bool,
    /// The last triangle has left the queue.
    last_taken: bool,
    walker: Box<dyn Walker>,
    /// Generated stamps, the newest held back until its successor exists.
    stamps: VecDeque<Stamp>,
    end_tagged: bool,
    msaa_wait: u32,
    sequence: u64,
    hz_ready: UnitState,
    batches: u64,

    stats: Statistics,
    progress: ProgressMonitor,
}

impl TriangleTraversal {
    pub fn new(
        name: impl Into<String>,
        cfg: TraversalConfig,
        ports: TriangleTraversalPorts,
        emu: SharedEmulator,
        mapper: PixelMapper,
    ) -> Self {
        Self {
            name: name.into(),
            triangles: RingQueue::new("traversal triangle queue", cfg.triangle_queue_size),
            walker: walker_for(cfg.strategy, cfg.triangle_batch),
            cfg,
            ports,
            emu,
            mapper,
            state: RasterizerState::Reset,
            msaa_enabled: false,
            msaa_samples: 2,
            requested: 0,
            last_received: false,
            last_taken: false,
            stamps: VecDeque::new(),
            end_tagged: false,
            msaa_wait: 0,
            sequence: 0,
            hz_ready: UnitState::Busy,
            batches: 0,
            stats: Statistics::with_counters(&[
                "inputs", "requests", "outputs", "culled_triangles", "fragments", "stamps_1frag",
                "stamps_2frag", "stamps_3frag", "stamps_4frag",
            ]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &TriangleTraversalPorts {
        &self.ports
    }

    fn samples(&self) -> usize {
        if self.msaa_enabled {
            self.msaa_samples
        } else {
            1
        }
    }

    fn start_draw(&mut self) {
        self.triangles.clear();
        self.stamps.clear();
        self.requested = 0;
        self.last_received = false;
        self.last_taken = false;
        self.end_tagged = false;
        self.msaa_wait = 0;
        self.walker = walker_for(self.cfg.strategy, self.cfg.triangle_batch);
        self.state = RasterizerState::Drawing;
    }

    fn process_command(&mut self, command: RasterizerCommand) {
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::Draw) => self.start_draw(),
            (RasterizerState::Ready, RasterizerCommand::RegisterWrite { reg, data, .. }) => {
                self.process_register_write(reg, data)
            }
            (RasterizerState::End, RasterizerCommand::End) => self.state = RasterizerState::Ready,
            (state, command) => unsupported(&self.name, state, &command),
        }
    }

    fn process_register_write(&mut self, reg: GpuRegister, data: GpuRegData) {
        match reg {
            // The emulator clips to the viewport; nothing to keep here.
            GpuRegister::Resolution | GpuRegister::Viewport => {}
            GpuRegister::MultisamplingEnable => self.msaa_enabled = data.as_bool(),
            GpuRegister::MsaaSamples => self.msaa_samples = data.as_uint() as usize,
            other => panic!("{}: unsupported register {other:?}", self.name),
        }
    }

    fn receive(&mut self, cycle: u64) {
        while let Some(triangle) = self.ports.input.read(cycle) {
            self.requested = self.requested.saturating_sub(1);
            if triangle.last {
                self.last_received = true;
            }
            if triangle.id.is_some() {
                self.stats.inc("inputs");
            }
            self.progress.note(cycle);
            self.triangles.push(triangle);
        }
        let tc = self.cfg.triangles_cycle;
        if !self.last_received
            && self.triangles.len() + (self.requested + tc) as usize <= self.triangles.capacity()
        {
            self.ports.request.write(cycle, tc);
            self.requested += tc;
            self.stats.add("requests", tc as u64);
        }
    }

    /// Pull the next batch of live triangles off the queue.
    fn next_batch(&mut self) -> bool {
        let mut batch: Vec<TriangleId> = Vec::new();
        while batch.len() < self.walker.batch_limit() {
            let Some(triangle) = self.triangles.pop() else {
                break;
            };
            match triangle.id {
                Some(id) if !triangle.culled => batch.push(id),
                Some(_) => self.stats.inc("culled_triangles"),
                None => {}
            }
            if triangle.last {
                self.last_taken = true;
                break;
            }
        }
        if batch.is_empty() {
            return false;
        }
        log::trace!("{}: batch {} with {} triangles", self.name, self.batches, batch.len());
        self.batches += 1;
        let emu = self.emu.borrow();
        self.walker.start(&*emu, batch);
        true
    }

    fn generate(&mut self) {
        if self.msaa_wait > 0 {
            self.msaa_wait -= 1;
            return;
        }
        let samples = self.samples();
        let budget = self.cfg.stamps_cycle as usize;
        let mut generated = 0;
        while generated < budget && self.stamps.len() <= budget {
            if self.walker.is_done() && (self.last_taken || !self.next_batch()) {
                break;
            }
            let next = {
                let emu = self.emu.borrow();
                self.walker.next_stamp(&*emu, samples)
            };
            let Some(mut stamp) = next else {
                continue;
            };
            stamp.unit = self.mapper.map_to_unit(stamp.x, stamp.y);
            self.stamps.push_back(stamp);
            generated += 1;
        }
        if generated > 0 && samples > 1 {
            self.msaa_wait = (samples as u32).div_ceil(self.cfg.samples_cycle) - 1;
        }

        if self.last_taken && self.walker.is_done() && !self.end_tagged {
            let tagged_unit = self.stamps.back_mut().map(|s| {
                s.last = true;
                s.unit
            });
            for unit in 0..self.mapper.units {
                if Some(unit) != tagged_unit {
                    self.stamps.push_back(Stamp::end_marker(unit, 0));
                }
            }
            self.end_tagged = true;
            log::debug!("{}: draw traversed, last stamp unit {tagged_unit:?}", self.name);
        }
    }

    fn send(&mut self, cycle: u64) {
        if !self.hz_ready.accepts() {
            return;
        }
        let mut sent = 0;
        while sent < self.cfg.stamps_cycle {
            if self.stamps.len() <= 1 && !self.end_tagged {
                break;
            }
            let Some(mut stamp) = self.stamps.pop_front() else {
                break;
            };
            stamp.sequence = self.sequence;
            self.sequence += 1;
            if !stamp.marker {
                let live = stamp.live_fragments();
                self.stats.inc("outputs");
                self.stats.add("fragments", live as u64);
                self.stats.inc(match live {
                    1 => "stamps_1frag",
                    2 => "stamps_2frag",
                    3 => "stamps_3frag",
                    _ => "stamps_4frag",
                });
            }
            log::trace!(
                "{} cycle {cycle}: stamp ({}, {}) unit {} last={}",
                self.name,
                stamp.x,
                stamp.y,
                stamp.unit,
                stamp.last
            );
            self.ports.output.write(cycle, stamp);
            self.progress.note(cycle);
            sent += 1;
        }
        if self.end_tagged && self.stamps.is_empty() {
            log::debug!("{} cycle {cycle}: end of draw", self.name);
            self.state = RasterizerState::End;
        }
    }
}

impl PipelineStage for TriangleTraversal {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        if let Some(s) = self.ports.hz_state.read_latest(cycle) {
            self.hz_ready = s;
        }
        match self.state {
            RasterizerState::Reset => {
                self.msaa_enabled = false;
                self.msaa_samples = 2;
                self.start_draw();
                self.state = RasterizerState::Ready;
            }
            RasterizerState::Ready | RasterizerState::End => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(command);
                }
            }
            RasterizerState::Drawing => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(command);
                }
                if self.state == RasterizerState::Drawing {
                    self.receive(cycle);
                    self.generate();
                    self.send(cycle);
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
            " state = {} | Triangle Queue = {} | Requested = {} | Stamps = {} | Batches = {}",
            self.state,
            self.triangles.len(),
            self.requested,
            self.stamps.len(),
            self.batches
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let pending = self.state == RasterizerState::Drawing
            && (!self.stamps.is_empty() || !self.triangles.is_empty() || !self.walker.is_done());
        StallStatus::checked(self.progress.stalled(cycle, threshold, pending))
    }

    fn stall_report(&self, cycle: u64) -> String {
        format!(
            "{} stall report for cycle {cycle}\n{}\n HZ state = {:?} | walker done = {} | end tagged = {}\n",
            self.name,
            self.get_state(),
            self.hz_ready,
            self.walker.is_done(),
            self.end_tagged
        )
    }
}
