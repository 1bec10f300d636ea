//! Hierarchical Z box.
//!
//! Keeps one conservative depth per screen block (the maximum depth the
//! Z/Stencil units have stored in that block) and removes stamps that are
//! certain to fail the depth test before they reach interpolation and
//! shading. Stamps move through three in-order stages:
//!
//! * read: reserve the HZ cache line of every block the stamp touches,
//!   fetching missing lines over the HZ buffer bus,
//! * test: once the lines are valid, compare the stamp minimum depth,
//! * send: forward survivors to FragmentFIFO.
//!
//! Block refreshes from the Z/Stencil units share the same bus, one access
//! per cycle.

use std::collections::VecDeque;
use std::path::PathBuf;

use rsim_core::command::unsupported;
use rsim_core::config::HzConfig;
use rsim_core::stage::ProgressMonitor;
use rsim_core::{
    BlockLayout, CompareFunction, GpuRegData, GpuRegister, HzUpdate, PipelineStage,
    RasterizerCommand, RasterizerState, Result, RingQueue, Signal, Stamp, StallStatus,
    Statistics, UnitState,
};

pub mod buffer;
pub mod cache;

pub use buffer::{HzBuffer, HZ_BUFFER_MAGIC};
pub use cache::HzCache;

/// File name of the HZ buffer inside the state directory.
pub const HZ_STATE_FILE: &str = "hz_buffer.bin";

/// Depth a cleared block starts with when no clear value was programmed.
pub const DEFAULT_CLEAR_DEPTH: u32 = 0x00ff_ffff;

/// Whether HZ may cull a stamp whose minimum depth is `stamp_z` against a
/// block whose stored depths are all `<= block_z`.
///
/// Only functions that fail for every depth not below the block maximum can
/// cull; for every other function the test must let the stamp through.
pub fn hz_culls(function: CompareFunction, stamp_z: u32, block_z: u32) -> bool {
    match function {
        CompareFunction::Less => stamp_z >= block_z,
        CompareFunction::Lequal | CompareFunction::Equal => stamp_z > block_z,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct HierarchicalZPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Stamps from TriangleTraversal.
    pub input: Signal<Stamp>,
    pub input_state: Signal<UnitState>,
    /// Stamps to FragmentFIFO.
    pub output: Signal<Stamp>,
    pub output_state: Signal<UnitState>,
    /// Block refreshes, one signal per Z/Stencil unit.
    pub updates: Vec<Signal<HzUpdate>>,
}

impl HierarchicalZPorts {
    pub fn new(cfg: &HzConfig, input: Signal<Stamp>, input_state: Signal<UnitState>, updates: Vec<Signal<HzUpdate>>) -> Self {
        Self {
            command: Signal::state("RasterizerToHierarchicalZ"),
            state: Signal::state("HierarchicalZState"),
            input,
            input_state,
            output: Signal::new("HierarchicalZToFragmentFIFO", cfg.stamps_cycle, 1),
            output_state: Signal::state("FragmentFIFOToHierarchicalZState"),
            updates,
        }
    }
}

#[derive(Debug, Clone)]
struct HzEntry {
    stamp: Stamp,
    /// Blocks touched by live fragments and the line reserved for each.
    blocks: Vec<(u32, Option<usize>)>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    ready: u64,
    line: usize,
}

/// Window in pixels, `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
}

impl Window {
    fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    fn set(&mut self, subreg: u32, data: GpuRegData) {
        let (w, h) = (self.x1 - self.x0, self.y1 - self.y0);
        match subreg {
            0 => {
                self.x0 = data.as_int();
                self.x1 = self.x0 + w;
            }
            1 => {
                self.y0 = data.as_int();
                self.y1 = self.y0 + h;
            }
            2 => self.x1 = self.x0 + data.as_int(),
            _ => self.y1 = self.y0 + data.as_int(),
        }
    }
}

pub struct HierarchicalZ {
    name: String,
    cfg: HzConfig,
    ports: HierarchicalZPorts,
    layout: BlockLayout,
    units: usize,
    state_dir: Option<PathBuf>,
    state: RasterizerState,

    hres: u32,
    vres: u32,
    viewport: Window,
    scissor_enabled: bool,
    scissor: Window,
    hz_enabled: bool,
    depth_test: bool,
    depth_function: CompareFunction,
    stencil_test: bool,
    modify_depth: bool,
    clear_depth: u32,
    msaa_enabled: bool,
    msaa_samples: usize,

    buffer: HzBuffer,
    cache: HzCache,
    read_q: RingQueue<HzEntry>,
    test_q: RingQueue<HzEntry>,
    send_q: RingQueue<Stamp>,
    pending_reads: VecDeque<PendingRead>,
    updates: VecDeque<HzUpdate>,
    output_ready: UnitState,
    last_sent: usize,
    clear_cycles: u32,

    stats: Statistics,
    progress: ProgressMonitor,
}

impl HierarchicalZ {
    pub fn new(
        name: impl Into<String>,
        cfg: HzConfig,
        ports: HierarchicalZPorts,
        layout: BlockLayout,
        units: usize,
        state_dir: Option<PathBuf>,
    ) -> Self {
        let full = Window {
            x0: 0,
            y0: 0,
            x1: layout.width as i32,
            y1: layout.height as i32,
        };
        Self {
            name: name.into(),
            buffer: HzBuffer::new(layout.block_count(), DEFAULT_CLEAR_DEPTH),
            cache: HzCache::new(cfg.cache_lines, cfg.cache_line_size),
            read_q: RingQueue::new("HZ read stage", cfg.queue_size),
            test_q: RingQueue::new("HZ test stage", cfg.queue_size),
            send_q: RingQueue::new("HZ send stage", cfg.queue_size),
            cfg,
            ports,
            layout,
            units,
            state_dir,
            state: RasterizerState::Reset,
            hres: layout.width,
            vres: layout.height,
            viewport: full,
            scissor_enabled: false,
            scissor: full,
            hz_enabled: false,
            depth_test: false,
            depth_function: CompareFunction::Less,
            stencil_test: false,
            modify_depth: false,
            clear_depth: DEFAULT_CLEAR_DEPTH,
            msaa_enabled: false,
            msaa_samples: 2,
            pending_reads: VecDeque::new(),
            updates: VecDeque::new(),
            output_ready: UnitState::Busy,
            last_sent: 0,
            clear_cycles: 0,
            stats: Statistics::with_counters(&[
                "inputs", "outputs", "out_triangle", "out_viewport", "out_scissor", "culled",
                "cull_outside", "cull_hz", "hits", "misses", "reads", "writes",
            ]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &HierarchicalZPorts {
        &self.ports
    }

    pub fn hz_buffer(&self) -> &HzBuffer {
        &self.buffer
    }

    /// Stored conservative depth of `block`.
    pub fn block_value(&self, block: u32) -> u32 {
        self.buffer.get(block)
    }

    pub fn save_hz_buffer(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.buffer.save(path)
    }

    /// Replace the buffer with a saved one. Cached copies are dropped.
    pub fn load_hz_buffer(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.buffer.load(path)?;
        self.cache.invalidate();
        Ok(())
    }

    fn samples(&self) -> usize {
        if self.msaa_enabled {
            self.msaa_samples
        } else {
            1
        }
    }

    fn test_active(&self) -> bool {
        self.hz_enabled
            && !self.cfg.disable
            && self.depth_test
            && !self.stencil_test
            && !self.modify_depth
            && matches!(
                self.depth_function,
                CompareFunction::Less | CompareFunction::Lequal | CompareFunction::Equal
            )
    }

    fn queued(&self) -> usize {
        self.read_q.len() + self.test_q.len() + self.send_q.len()
    }

    fn free(&self) -> usize {
        self.cfg.queue_size - self.queued()
    }

    fn reset_registers(&mut self) {
        let full = Window {
            x0: 0,
            y0: 0,
            x1: self.layout.width as i32,
            y1: self.layout.height as i32,
        };
        self.hres = self.layout.width;
        self.vres = self.layout.height;
        self.viewport = full;
        self.scissor = full;
        self.scissor_enabled = false;
        self.hz_enabled = false;
        self.depth_test = false;
        self.depth_function = CompareFunction::Less;
        self.stencil_test = false;
        self.modify_depth = false;
        self.clear_depth = DEFAULT_CLEAR_DEPTH;
        self.msaa_enabled = false;
        self.msaa_samples = 2;
    }

    fn state_file(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(HZ_STATE_FILE))
    }

    fn process_command(&mut self, cycle: u64, command: RasterizerCommand) {
        log::debug!("{} cycle {cycle}: command {command:?} in {}", self.name, self.state);
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                self.last_sent = 0;
                self.state = RasterizerState::Drawing;
            }
            (RasterizerState::Ready, RasterizerCommand::RegisterWrite { reg, subreg, data }) => {
                self.process_register_write(reg, subreg, data)
            }
            (RasterizerState::Ready, RasterizerCommand::ClearZStencil) => {
                let blocks = self.hres.div_ceil(self.layout.block_size) * self.vres.div_ceil(self.layout.block_size);
                self.clear_cycles = blocks.div_ceil(self.cfg.clear_blocks_cycle);
                self.state = RasterizerState::Clear;
            }
            (RasterizerState::Ready, RasterizerCommand::SaveState) => {
                if let Some(path) = self.state_file() {
                    if let Err(e) = self.save_hz_buffer(&path) {
                        panic!("{}: saving HZ buffer to {}: {e}", self.name, path.display());
                    }
                    log::info!("{} cycle {cycle}: HZ buffer saved to {}", self.name, path.display());
                }
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::RestoreState) => {
                if let Some(path) = self.state_file() {
                    if let Err(e) = self.load_hz_buffer(&path) {
                        panic!("{}: restoring HZ buffer from {}: {e}", self.name, path.display());
                    }
                    log::info!("{} cycle {cycle}: HZ buffer restored from {}", self.name, path.display());
                }
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::ResetState) => {
                self.buffer.fill(self.clear_depth);
                self.cache.invalidate();
                self.state = RasterizerState::End;
            }
            (RasterizerState::End | RasterizerState::ClearEnd, RasterizerCommand::End) => {
                self.state = RasterizerState::Ready
            }
            (state, command) => unsupported(&self.name, state, &command),
        }
    }

    fn process_register_write(&mut self, reg: GpuRegister, subreg: u32, data: GpuRegData) {
        match reg {
            GpuRegister::Resolution => match subreg {
                0 => self.hres = data.as_uint(),
                _ => self.vres = data.as_uint(),
            },
            GpuRegister::Viewport => self.viewport.set(subreg, data),
            GpuRegister::ScissorTest => self.scissor_enabled = data.as_bool(),
            GpuRegister::Scissor => self.scissor.set(subreg, data),
            GpuRegister::HierarchicalZ => self.hz_enabled = data.as_bool(),
            GpuRegister::DepthTest => self.depth_test = data.as_bool(),
            GpuRegister::DepthFunction => self.depth_function = data.as_compare(),
            GpuRegister::StencilTest => self.stencil_test = data.as_bool(),
            GpuRegister::ModifyFragmentDepth => self.modify_depth = data.as_bool(),
            GpuRegister::ZBufferClear => self.clear_depth = data.as_uint() & 0x00ff_ffff,
            GpuRegister::MultisamplingEnable => self.msaa_enabled = data.as_bool(),
            GpuRegister::MsaaSamples => self.msaa_samples = data.as_uint() as usize,
            other => panic!("{}: unsupported register {other:?}", self.name),
        }
    }

    /// Apply every block refresh received this cycle. Any refresh takes the
    /// bus for the cycle. Refreshes arriving during a clear are held and
    /// dropped when the clear completes. Returns whether the bus is still
    /// free for a line read.
    fn bus_updates(&mut self, cycle: u64) -> bool {
        for signal in &self.ports.updates {
            while let Some(u) = signal.read(cycle) {
                self.updates.push_back(u);
            }
        }
        if self.state == RasterizerState::Clear {
            return false;
        }
        if self.updates.is_empty() {
            return true;
        }
        while let Some(u) = self.updates.pop_front() {
            log::trace!("{} cycle {cycle}: block {} refreshed to {:#x}", self.name, u.block, u.z);
            self.buffer.set(u.block, u.z);
            self.cache.update(u.block, u.z);
            self.stats.inc("writes");
        }
        false
    }

    fn complete_reads(&mut self, cycle: u64) {
        while let Some(r) = self.pending_reads.front().copied() {
            if r.ready > cycle {
                break;
            }
            self.pending_reads.pop_front();
            let first = self.cache.first_block(r.line) as usize;
            let n = self.cache.line_size();
            let mut values = vec![self.clear_depth; n];
            for (i, v) in values.iter_mut().enumerate() {
                if let Some(&z) = self.buffer.as_slice().get(first + i) {
                    *v = z;
                }
            }
            self.cache.fill(r.line, &values);
        }
    }

    fn send(&mut self, cycle: u64) {
        if !self.output_ready.accepts() {
            return;
        }
        for _ in 0..self.cfg.stamps_cycle {
            let Some(stamp) = self.send_q.pop() else {
                break;
            };
            if stamp.last {
                self.last_sent += 1;
            }
            if !stamp.marker {
                self.stats.inc("outputs");
            }
            self.ports.output.write(cycle, stamp);
            self.progress.note(cycle);
        }
    }

    fn block_min_depth(&self, stamp: &Stamp, block: u32, samples: usize) -> Option<u32> {
        let mut min: Option<u32> = None;
        for f in stamp.fragments.iter().filter(|f| f.is_live()) {
            if self.layout.block_of(f.x, f.y) != block {
                continue;
            }
            let z = if samples > 1 {
                (0..samples)
                    .filter(|&s| f.coverage & (1 << s) != 0)
                    .map(|s| f.samples[s])
                    .min()
            } else {
                Some(f.z)
            };
            if let Some(z) = z {
                min = Some(min.map_or(z, |m| m.min(z)));
            }
        }
        min
    }

    fn test(&mut self, cycle: u64) {
        let samples = self.samples();
        for _ in 0..self.cfg.stamps_cycle {
            let ready = match self.test_q.front() {
                Some(e) => e
                    .blocks
                    .iter()
                    .all(|&(_, line)| line.is_some_and(|l| self.cache.is_valid(l))),
                None => false,
            };
            if !ready || self.send_q.is_full() {
                break;
            }
            let Some(entry) = self.test_q.pop() else {
                break;
            };
            let mut culled = !entry.blocks.is_empty();
            for &(block, line) in &entry.blocks {
                let Some(line) = line else {
                    continue;
                };
                let block_z = self.cache.value(line, block);
                let stamp_z = self.block_min_depth(&entry.stamp, block, samples);
                if !stamp_z.is_some_and(|z| hz_culls(self.depth_function, z, block_z)) {
                    culled = false;
                }
                self.cache.release(line);
            }
            self.progress.note(cycle);
            if !culled {
                self.send_q.push(entry.stamp);
                continue;
            }
            self.stats.inc("cull_hz");
            self.stats.add("culled", entry.stamp.live_fragments() as u64);
            log::trace!("{} cycle {cycle}: stamp ({}, {}) culled", self.name, entry.stamp.x, entry.stamp.y);
            if entry.stamp.last {
                self.send_q.push(entry.stamp.into_marker());
            }
        }
    }

    /// Reserve cache lines for the oldest stamps. Stops at the first stamp
    /// whose lines cannot all be reserved this cycle.
    fn read(&mut self, cycle: u64, mut bus_free: bool) {
        for _ in 0..self.cfg.stamps_cycle {
            if self.test_q.is_full() {
                break;
            }
            let Some(entry) = self.read_q.front_mut() else {
                break;
            };
            let mut complete = true;
            for (block, line) in entry.blocks.iter_mut() {
                if line.is_some() {
                    continue;
                }
                if let Some(l) = self.cache.search(*block) {
                    self.cache.reserve(l);
                    *line = Some(l);
                    self.stats.inc("hits");
                    continue;
                }
                if !bus_free {
                    complete = false;
                    break;
                }
                let Some(l) = self.cache.insert(*block) else {
                    complete = false;
                    break;
                };
                self.cache.reserve(l);
                *line = Some(l);
                bus_free = false;
                self.pending_reads.push_back(PendingRead {
                    ready: cycle + self.cfg.buffer_latency,
                    line: l,
                });
                self.stats.inc("misses");
                self.stats.inc("reads");
            }
            if !complete {
                break;
            }
            if let Some(entry) = self.read_q.pop() {
                self.test_q.push(entry);
            }
        }
    }

    /// Per-fragment culling against triangle, viewport and scissor.
    fn cull_fragments(&mut self, stamp: &mut Stamp) {
        for f in stamp.fragments.iter_mut() {
            if f.culled {
                if !stamp.marker {
                    self.stats.inc("out_triangle");
                }
                continue;
            }
            if !self.viewport.contains(f.x, f.y) || !self.layout.contains(f.x, f.y) {
                f.culled = true;
                self.stats.inc("out_viewport");
            } else if self.scissor_enabled && !self.scissor.contains(f.x, f.y) {
                f.culled = true;
                self.stats.inc("out_scissor");
            }
        }
    }

    fn receive(&mut self, cycle: u64) {
        let test = self.test_active();
        for _ in 0..self.cfg.stamps_cycle {
            let Some(mut stamp) = self.ports.input.read(cycle) else {
                break;
            };
            self.progress.note(cycle);
            if !stamp.marker {
                self.stats.inc("inputs");
                self.cull_fragments(&mut stamp);
                if stamp.all_culled() {
                    self.stats.inc("cull_outside");
                    if !stamp.last {
                        continue;
                    }
                    stamp = stamp.into_marker();
                }
            }
            let mut blocks: Vec<(u32, Option<usize>)> = Vec::new();
            if test && !stamp.marker {
                for f in stamp.fragments.iter().filter(|f| f.is_live()) {
                    let b = self.layout.block_of(f.x, f.y);
                    if !blocks.iter().any(|&(x, _)| x == b) {
                        blocks.push((b, None));
                    }
                }
            }
            if self.queued() >= self.cfg.queue_size {
                panic!("{}: stamp received with the HZ queue full", self.name);
            }
            self.read_q.push(HzEntry { stamp, blocks });
        }
    }

    fn draw_cycle(&mut self, cycle: u64, bus_free: bool) {
        self.send(cycle);
        self.test(cycle);
        self.read(cycle, bus_free);
        self.receive(cycle);
        if self.last_sent == self.units && self.queued() == 0 {
            log::debug!("{} cycle {cycle}: end of draw", self.name);
            self.state = RasterizerState::End;
        }
    }
}

impl PipelineStage for HierarchicalZ {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        if let Some(s) = self.ports.output_state.read_latest(cycle) {
            self.output_ready = s;
        }
        let bus_free = self.bus_updates(cycle);
        self.complete_reads(cycle);

        match self.state {
            RasterizerState::Reset => {
                self.reset_registers();
                self.buffer.fill(self.clear_depth);
                self.read_q.clear();
                self.test_q.clear();
                self.send_q.clear();
                self.pending_reads.clear();
                self.updates.clear();
                self.cache = HzCache::new(self.cfg.cache_lines, self.cfg.cache_line_size);
                self.state = RasterizerState::Ready;
            }
            RasterizerState::Ready | RasterizerState::End | RasterizerState::ClearEnd => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
            }
            RasterizerState::Drawing => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
                if self.state == RasterizerState::Drawing {
                    self.draw_cycle(cycle, bus_free);
                }
            }
            RasterizerState::Clear => {
                self.clear_cycles = self.clear_cycles.saturating_sub(1);
                if self.clear_cycles == 0 {
                    self.buffer.fill(self.clear_depth);
                    self.cache.invalidate();
                    self.updates.clear();
                    log::debug!("{} cycle {cycle}: HZ buffer cleared to {:#x}", self.name, self.clear_depth);
                    self.state = RasterizerState::ClearEnd;
                }
            }
            other => panic!("{}: unsupported state {other}", self.name),
        }

        let ready = self.state == RasterizerState::Drawing && self.free() > 2 * self.cfg.stamps_cycle as usize;
        self.ports
            .input_state
            .write(cycle, if ready { UnitState::Ready } else { UnitState::Busy });
        self.ports.state.write(cycle, self.state);
    }

    fn state(&self) -> RasterizerState {
        self.state
    }

    fn get_state(&self) -> String {
        format!(
            " state = {} | Read = {} | Test = {} | Send = {} | Free = {} | Pending Reads = {} | Pending Updates = {} | Last Stamps = {}/{}",
            self.state,
            self.read_q.len(),
            self.test_q.len(),
            self.send_q.len(),
            self.free(),
            self.pending_reads.len(),
            self.updates.len(),
            self.last_sent,
            self.units
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn command_list(&self) -> Vec<&'static str> {
        vec![
            "block <n> - print the stored depth of block n",
            "cache - print HZ cache occupancy",
        ]
    }

    fn exec_box_command(&mut self, command: &str, args: &[&str]) -> Option<String> {
        match command {
            "block" => Some(match args.first().and_then(|a| a.parse::<u32>().ok()) {
                Some(b) if (b as usize) < self.buffer.len() => format!("block {b} = {:#08x}", self.buffer.get(b)),
                _ => "usage: block <n>".to_string(),
            }),
            "cache" => Some(format!(
                "resident {}/{} | reserved {}",
                self.cache.resident(),
                self.cache.capacity(),
                self.cache.reserved()
            )),
            _ => None,
        }
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let pending = self.state == RasterizerState::Drawing && self.queued() > 0;
        StallStatus::checked(self.progress.stalled(cycle, threshold, pending))
    }

    fn stall_report(&self, cycle: u64) -> String {
        let head = self
            .read_q
            .front()
            .map(|e| format!("read head ({}, {}) blocks {:?}", e.stamp.x, e.stamp.y, e.blocks))
            .unwrap_or_default();
        format!(
            "{} stall report for cycle {cycle}\n{}\n FragmentFIFO state = {:?} | cache reserved {}/{} | {head}\n",
            self.name,
            self.get_state(),
            self.output_ready,
            self.cache.reserved(),
            self.cache.capacity()
        )
    }
}
