//! Z/Stencil test box, one instance per stamp unit.
//!
//! Stamps move through a generic ROP pipeline:
//!
//! 1. input queue,
//! 2. fetch: reserve the Z cache line of the stamp's block, starting a
//!    memory read on a miss,
//! 3. read: wait for the line data and for any older stamp on the same
//!    quad to be written (read-after-write CAM),
//! 4. operation: `rop_latency` cycles, one stamp every `rop_rate` cycles,
//! 5. write: store the results in the line and release it,
//! 6. terminate: return the stamp to FragmentFIFO.
//!
//! Dirty lines go back to memory on eviction or flush. Each write-back
//! picks a compression level for the block and refreshes the block's
//! conservative depth in Hierarchical Z.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat, Luma};
use rsim_core::command::unsupported;
use rsim_core::config::ZStencilConfig;
use rsim_core::stage::ProgressMonitor;
use rsim_core::stamp::STAMP_FRAGMENTS;
use rsim_core::{
    GpuRegData, GpuRegister, HzUpdate, PipelineStage, PixelMapper, RasterizerCommand,
    RasterizerState, Result, RingQueue, Signal, SimError, Stamp, StallStatus, Statistics,
    TriangleId, UnitState,
};

pub mod cache;
pub mod memory;
pub mod ops;

use cache::{Allocation, LineId, ZCache};
use memory::{depth_of, stencil_of, BlockState, DepthMemory, DEPTH_MASK};
use ops::DepthStencilState;

#[derive(Debug, Clone)]
pub struct ZStencilPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Stamps from FragmentFIFO.
    pub input: Signal<Stamp>,
    pub input_state: Signal<UnitState>,
    /// Tested stamps back to FragmentFIFO.
    pub output: Signal<Stamp>,
    pub output_state: Signal<UnitState>,
    pub hz_update: Signal<HzUpdate>,
}

impl ZStencilPorts {
    pub fn new(cfg: &ZStencilConfig, unit: usize) -> Self {
        Self {
            command: Signal::state(format!("RasterizerToZStencilTest{unit}")),
            state: Signal::state(format!("ZStencilTest{unit}State")),
            input: Signal::new(format!("FragmentFIFOToZStencilTest{unit}"), cfg.stamps_cycle, 1),
            input_state: Signal::state(format!("ZStencilTest{unit}ToFragmentFIFOState")),
            output: Signal::new(format!("ZStencilTest{unit}ToFragmentFIFO"), cfg.stamps_cycle, 1),
            output_state: Signal::state(format!("FragmentFIFOToZStencilTest{unit}State")),
            hz_update: Signal::new(format!("ZStencilTest{unit}ToHierarchicalZ"), cfg.stamps_cycle, cfg.hz_update_latency),
        }
    }
}

/// Key of a quad update in the validation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentId {
    pub triangle: TriangleId,
    pub x: i32,
    pub y: i32,
}

/// Memory words of one quad before and after the test, fragment major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuadMemoryUpdate {
    pub read: Vec<u32>,
    pub written: Vec<u32>,
    pub mask: Vec<bool>,
}

#[derive(Debug)]
struct ZEntry {
    stamp: Stamp,
    line: Option<LineId>,
    read: Vec<u32>,
    /// New word per read word, `None` where unchanged.
    write: Vec<Option<u32>>,
    done: u64,
}

impl ZEntry {
    fn new(stamp: Stamp) -> Self {
        Self {
            stamp,
            line: None,
            read: Vec::new(),
            write: Vec::new(),
            done: 0,
        }
    }
}

pub struct ZStencilTest {
    name: String,
    cfg: ZStencilConfig,
    ports: ZStencilPorts,
    mapper: PixelMapper,
    unit: usize,
    state_dir: Option<PathBuf>,
    dump_dir: Option<PathBuf>,
    state: RasterizerState,

    regs: DepthStencilState,
    msaa_enabled: bool,
    msaa_samples: usize,

    memory: DepthMemory,
    cache: ZCache,
    input_q: RingQueue<ZEntry>,
    fetch_q: RingQueue<ZEntry>,
    read_q: RingQueue<ZEntry>,
    op_q: VecDeque<ZEntry>,
    write_q: RingQueue<ZEntry>,
    term_q: RingQueue<Stamp>,
    /// Completion cycles of outstanding memory reads.
    requests: VecDeque<u64>,
    /// Quads between read and write.
    cam: Vec<(i32, i32)>,
    next_op: u64,
    output_ready: UnitState,
    last_sent: bool,
    clear_cycles: u32,
    dumps: u32,

    validation: BTreeMap<FragmentId, QuadMemoryUpdate>,
    stats: Statistics,
    progress: ProgressMonitor,
}

impl ZStencilTest {
    pub fn new(
        name: impl Into<String>,
        cfg: ZStencilConfig,
        ports: ZStencilPorts,
        mapper: PixelMapper,
        unit: usize,
        state_dir: Option<PathBuf>,
        dump_dir: Option<PathBuf>,
    ) -> Self {
        let memory = DepthMemory::new(mapper.layout, 1);
        Self {
            name: name.into(),
            cache: ZCache::new(cfg.cache_ways, cfg.cache_lines, memory.block_words()),
            memory,
            input_q: RingQueue::new("ZST input", cfg.input_queue),
            fetch_q: RingQueue::new("ZST fetched", cfg.fetch_queue),
            read_q: RingQueue::new("ZST read", cfg.read_queue),
            op_q: VecDeque::with_capacity(cfg.op_queue),
            write_q: RingQueue::new("ZST write", cfg.write_queue),
            term_q: RingQueue::new("ZST terminate", cfg.write_queue),
            cfg,
            ports,
            mapper,
            unit,
            state_dir,
            dump_dir,
            state: RasterizerState::Reset,
            regs: DepthStencilState::default(),
            msaa_enabled: false,
            msaa_samples: 2,
            requests: VecDeque::new(),
            cam: Vec::new(),
            next_op: 0,
            output_ready: UnitState::Busy,
            last_sent: false,
            clear_cycles: 0,
            dumps: 0,
            validation: BTreeMap::new(),
            stats: Statistics::with_counters(&[
                "inputs", "outputs", "tested", "passed", "failed", "culled", "hits", "misses", "reads",
                "writebacks", "hz_updates", "comp_level0", "comp_level1", "uncompressed", "raw_stalls",
            ]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &ZStencilPorts {
        &self.ports
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn registers(&self) -> &DepthStencilState {
        &self.regs
    }

    pub fn memory(&self) -> &DepthMemory {
        &self.memory
    }

    /// Committed quad updates, recorded when validation is enabled.
    pub fn validation_log(&self) -> &BTreeMap<FragmentId, QuadMemoryUpdate> {
        &self.validation
    }

    pub fn take_validation_log(&mut self) -> BTreeMap<FragmentId, QuadMemoryUpdate> {
        std::mem::take(&mut self.validation)
    }

    pub fn save_block_state_memory(&self, path: impl AsRef<Path>) -> Result<()> {
        self.memory.save_block_states(path)
    }

    /// Restore block states. Cached lines are dropped.
    pub fn load_block_state_memory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.memory.load_block_states(path)?;
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

    /// Word index inside the block line of read word `i` of `stamp`.
    fn word_index(&self, stamp: &Stamp, i: usize) -> usize {
        let samples = self.memory.samples();
        let f = &stamp.fragments[i / samples];
        self.mapper.layout.offset_in_block(f.x, f.y) * samples + i % samples
    }

    /// Sample 0 of pixel `(x, y)` as stored, through the cache. `None` for
    /// pixels this unit does not own.
    pub fn word_at(&self, x: i32, y: i32) -> Option<u32> {
        let layout = self.mapper.layout;
        if !layout.contains(x, y) || self.mapper.map_to_unit(x, y) != self.unit {
            return None;
        }
        let block = layout.block_of(x, y);
        let index = layout.offset_in_block(x, y) * self.memory.samples();
        Some(match self.cache.resident(block) {
            Some(data) => data[index],
            None => self.memory.word(block, index, self.regs.clear_word()),
        })
    }

    /// Depth (top 8 bits) or stencil of the pixels this unit owns.
    pub fn image(&self, stencil: bool) -> GrayImage {
        let layout = self.mapper.layout;
        GrayImage::from_fn(layout.width, layout.height, |x, y| {
            let v = match self.word_at(x as i32, y as i32) {
                Some(w) if stencil => stencil_of(w),
                Some(w) => (depth_of(w) >> 16) as u8,
                None => 0,
            };
            Luma([v])
        })
    }

    pub fn write_png(&self, path: impl AsRef<Path>, stencil: bool) -> Result<()> {
        self.image(stencil)
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| SimError::Io(std::io::Error::other(e)))
    }

    fn dump(&mut self, stencil: bool) {
        let kind = if stencil { "stencil" } else { "depth" };
        let Some(dir) = &self.dump_dir else {
            log::warn!("{}: no dump directory configured, {kind} dump skipped", self.name);
            return;
        };
        let path = dir.join(format!("{kind}_unit{}_{:04}.png", self.unit, self.dumps));
        match self.write_png(&path, stencil) {
            Ok(()) => log::info!("{}: {kind} written to {}", self.name, path.display()),
            Err(e) => log::error!("{}: writing {}: {e}", self.name, path.display()),
        }
        self.dumps += 1;
    }

    fn state_file(&self) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|d| d.join(format!("zst_block_state_{}.bin", self.unit)))
    }

    fn reset(&mut self) {
        self.regs = DepthStencilState::default();
        self.msaa_enabled = false;
        self.msaa_samples = 2;
        self.memory = DepthMemory::new(self.mapper.layout, 1);
        self.cache = ZCache::new(self.cfg.cache_ways, self.cfg.cache_lines, self.memory.block_words());
        self.input_q.clear();
        self.fetch_q.clear();
        self.read_q.clear();
        self.op_q.clear();
        self.write_q.clear();
        self.term_q.clear();
        self.requests.clear();
        self.cam.clear();
        self.validation.clear();
    }

    fn prepare_draw(&mut self) {
        let samples = self.samples();
        if samples != self.memory.samples() {
            log::debug!("{}: depth memory rebuilt for {samples} samples", self.name);
            self.memory = DepthMemory::new(self.mapper.layout, samples);
            self.cache = ZCache::new(self.cfg.cache_ways, self.cfg.cache_lines, self.memory.block_words());
        }
        self.last_sent = false;
        self.next_op = 0;
    }

    fn process_command(&mut self, cycle: u64, command: RasterizerCommand) {
        log::debug!("{} cycle {cycle}: command {command:?} in {}", self.name, self.state);
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::RegisterWrite { reg, subreg, data }) => {
                self.process_register_write(reg, subreg, data)
            }
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                self.prepare_draw();
                self.state = RasterizerState::Drawing;
            }
            (RasterizerState::Ready, RasterizerCommand::ClearZStencil) => {
                self.clear_cycles = (self.memory.blocks() as u32).div_ceil(self.cfg.clear_blocks_cycle);
                self.state = RasterizerState::Clear;
            }
            (
                RasterizerState::Ready,
                RasterizerCommand::Flush | RasterizerCommand::Swap | RasterizerCommand::FrameChange,
            ) => self.state = RasterizerState::Flush,
            (RasterizerState::Ready, RasterizerCommand::DumpDepth) => {
                self.dump(false);
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::DumpStencil) => {
                self.dump(true);
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::SaveState) => {
                if let Some(path) = self.state_file() {
                    if let Err(e) = self.save_block_state_memory(&path) {
                        panic!("{}: saving block states to {}: {e}", self.name, path.display());
                    }
                }
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::RestoreState) => {
                if let Some(path) = self.state_file() {
                    if let Err(e) = self.load_block_state_memory(&path) {
                        panic!("{}: restoring block states from {}: {e}", self.name, path.display());
                    }
                }
                self.state = RasterizerState::End;
            }
            (RasterizerState::Ready, RasterizerCommand::ResetState) => {
                self.memory.clear();
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
        let r = &mut self.regs;
        match reg {
            GpuRegister::DepthTest => r.depth_test = data.as_bool(),
            GpuRegister::DepthFunction => r.depth_function = data.as_compare(),
            GpuRegister::DepthMask => r.depth_mask = data.as_bool(),
            GpuRegister::ZBufferClear => r.clear_depth = data.as_uint() & DEPTH_MASK,
            GpuRegister::StencilTest => r.stencil_test = data.as_bool(),
            GpuRegister::StencilFunction => r.stencil_function = data.as_compare(),
            GpuRegister::StencilReference => r.stencil_reference = data.as_uint() as u8,
            GpuRegister::StencilTestMask => r.stencil_test_mask = data.as_uint() as u8,
            GpuRegister::StencilUpdateMask => r.stencil_update_mask = data.as_uint() as u8,
            GpuRegister::StencilFail => r.stencil_fail = data.as_stencil_update(),
            GpuRegister::DepthFail => r.depth_fail = data.as_stencil_update(),
            GpuRegister::DepthPass => r.depth_pass = data.as_stencil_update(),
            GpuRegister::StencilBufferClear => r.clear_stencil = data.as_uint() as u8,
            GpuRegister::MultisamplingEnable => self.msaa_enabled = data.as_bool(),
            GpuRegister::MsaaSamples => self.msaa_samples = data.as_uint() as usize,
            GpuRegister::DepthPrecision => {}
            other => panic!("{}: unsupported register {other:?} [{subreg}]", self.name),
        }
    }

    fn write_back(&mut self, cycle: u64, block: u32, data: Vec<u32>) {
        let state = if self.cfg.disable_compression {
            BlockState::Uncompressed
        } else {
            BlockState::for_words(&data)
        };
        self.stats.inc(match state {
            BlockState::Compressed(0) => "comp_level0",
            BlockState::Compressed(_) => "comp_level1",
            _ => "uncompressed",
        });
        self.stats.inc("writebacks");
        if !self.cfg.disable_hz_update && !self.cfg.disable_compression {
            let z = data.iter().map(|&w| depth_of(w)).max().unwrap_or(DEPTH_MASK);
            self.ports.hz_update.write(cycle, HzUpdate { block, z });
            self.stats.inc("hz_updates");
        }
        self.memory.write_block(block, &data, state);
    }

    fn terminate(&mut self, cycle: u64) {
        if !self.output_ready.accepts() {
            return;
        }
        for _ in 0..self.cfg.stamps_cycle {
            let Some(stamp) = self.term_q.pop() else {
                break;
            };
            if stamp.last {
                self.last_sent = true;
            }
            if !stamp.marker {
                self.stats.inc("outputs");
            }
            self.ports.output.write(cycle, stamp);
            self.progress.note(cycle);
        }
    }

    fn write(&mut self, cycle: u64) {
        for _ in 0..self.cfg.stamps_cycle {
            if self.term_q.is_full() {
                break;
            }
            let Some(e) = self.write_q.pop() else {
                break;
            };
            if let Some(line) = e.line {
                for (i, w) in e.write.iter().enumerate() {
                    if let Some(word) = *w {
                        let index = self.word_index(&e.stamp, i);
                        self.cache.set_word(line, index, word);
                    }
                }
                self.cache.release(line);
                if let Some(pos) = self.cam.iter().position(|&q| q == (e.stamp.x, e.stamp.y)) {
                    self.cam.swap_remove(pos);
                }
                if self.cfg.validation {
                    let id = FragmentId {
                        triangle: e.stamp.triangle,
                        x: e.stamp.x,
                        y: e.stamp.y,
                    };
                    let update = QuadMemoryUpdate {
                        written: e.write.iter().zip(&e.read).map(|(w, r)| w.unwrap_or(*r)).collect(),
                        mask: e.write.iter().map(Option::is_some).collect(),
                        read: e.read,
                    };
                    self.validation.insert(id, update);
                }
            }
            self.term_q.push(e.stamp);
            self.progress.note(cycle);
        }
    }

    fn test_stamp(&mut self, e: &mut ZEntry) {
        if e.line.is_none() {
            return;
        }
        let samples = self.memory.samples();
        e.write = vec![None; e.read.len()];
        for (i, f) in e.stamp.fragments.iter_mut().enumerate() {
            if f.culled {
                continue;
            }
            let mut survives = false;
            for s in 0..samples {
                let (covered, z) = if samples > 1 {
                    (f.coverage & (1 << s) != 0, f.samples[s])
                } else {
                    (true, f.z)
                };
                if !covered {
                    continue;
                }
                let idx = i * samples + s;
                let (pass, word) = self.regs.test_sample(z, e.read[idx]);
                survives |= pass;
                if word != e.read[idx] {
                    e.write[idx] = Some(word);
                }
            }
            self.stats.inc("tested");
            if survives {
                self.stats.inc("passed");
            } else {
                self.stats.inc("failed");
                f.culled = true;
            }
        }
        if e.stamp.all_culled() {
            self.stats.inc("culled");
        }
    }

    fn operate(&mut self, cycle: u64) {
        while self.op_q.front().is_some_and(|e| e.done <= cycle) && !self.write_q.is_full() {
            if let Some(e) = self.op_q.pop_front() {
                self.write_q.push(e);
                self.progress.note(cycle);
            }
        }
        if cycle < self.next_op || self.op_q.len() >= self.cfg.op_queue {
            return;
        }
        if let Some(mut e) = self.read_q.pop() {
            self.test_stamp(&mut e);
            e.done = cycle + self.cfg.rop_latency;
            self.op_q.push_back(e);
            self.next_op = cycle + self.cfg.rop_rate as u64;
            self.progress.note(cycle);
        }
    }

    fn read(&mut self, cycle: u64) {
        for _ in 0..self.cfg.stamps_cycle {
            if self.read_q.is_full() {
                break;
            }
            let Some(head) = self.fetch_q.front() else {
                break;
            };
            if let Some(line) = head.line {
                if !self.cache.is_ready(line, cycle) {
                    break;
                }
                if self.cam.contains(&(head.stamp.x, head.stamp.y)) {
                    self.stats.inc("raw_stalls");
                    break;
                }
            }
            let Some(mut e) = self.fetch_q.pop() else {
                break;
            };
            if let Some(line) = e.line {
                let words = STAMP_FRAGMENTS * self.memory.samples();
                e.read = (0..words)
                    .map(|i| self.cache.word(line, self.word_index(&e.stamp, i)))
                    .collect();
                self.cam.push((e.stamp.x, e.stamp.y));
            }
            self.read_q.push(e);
            self.progress.note(cycle);
        }
    }

    fn fetch(&mut self, cycle: u64) {
        for _ in 0..self.cfg.stamps_cycle {
            if self.fetch_q.is_full() {
                break;
            }
            let Some(head) = self.input_q.front() else {
                break;
            };
            let needs_line = self.regs.active() && !head.stamp.marker && head.stamp.live_fragments() > 0;
            if !needs_line {
                if let Some(e) = self.input_q.pop() {
                    self.fetch_q.push(e);
                }
                continue;
            }
            let block = self.mapper.layout.block_of(head.stamp.x, head.stamp.y);
            let memory_read = self.cache.lookup(block).is_none() && self.memory.state(block) != BlockState::Clear;
            if memory_read && self.requests.len() >= self.cfg.cache_request_queue {
                break;
            }
            let Some(allocation) = self.cache.allocate(block, cycle) else {
                break;
            };
            let line = match allocation {
                Allocation::Hit(line) => {
                    self.stats.inc("hits");
                    line
                }
                Allocation::Miss { line, evicted } => {
                    self.stats.inc("misses");
                    if let Some((victim, data)) = evicted {
                        self.write_back(cycle, victim, data);
                    }
                    let latency = self.memory.read_latency(block, self.cfg.memory_latency);
                    if self.memory.state(block) != BlockState::Clear {
                        self.requests.push_back(cycle + latency);
                        self.stats.inc("reads");
                    }
                    let data = self.memory.read_block(block, self.regs.clear_word());
                    self.cache.fill(line, data, cycle + latency);
                    line
                }
            };
            self.cache.reserve(line);
            if let Some(mut e) = self.input_q.pop() {
                e.line = Some(line);
                self.fetch_q.push(e);
            }
            self.progress.note(cycle);
        }
    }

    fn receive(&mut self, cycle: u64) {
        while let Some(stamp) = self.ports.input.read(cycle) {
            if !stamp.marker {
                self.stats.inc("inputs");
            }
            self.input_q.push(ZEntry::new(stamp));
            self.progress.note(cycle);
        }
    }

    fn queued(&self) -> usize {
        self.input_q.len() + self.fetch_q.len() + self.read_q.len() + self.op_q.len() + self.write_q.len() + self.term_q.len()
    }

    fn draw_cycle(&mut self, cycle: u64) {
        self.terminate(cycle);
        self.write(cycle);
        self.operate(cycle);
        self.read(cycle);
        self.fetch(cycle);
        self.receive(cycle);
        if self.last_sent && self.queued() == 0 {
            log::debug!("{} cycle {cycle}: end of draw", self.name);
            self.state = RasterizerState::End;
        }
    }
}

impl PipelineStage for ZStencilTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        if let Some(s) = self.ports.output_state.read_latest(cycle) {
            self.output_ready = s;
        }
        while self.requests.front().is_some_and(|&r| r <= cycle) {
            self.requests.pop_front();
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
            RasterizerState::Drawing => {
                if let Some(command) = self.ports.command.read(cycle) {
                    self.process_command(cycle, command);
                }
                if self.state == RasterizerState::Drawing {
                    self.draw_cycle(cycle);
                }
            }
            RasterizerState::Clear => {
                self.clear_cycles = self.clear_cycles.saturating_sub(1);
                if self.clear_cycles == 0 {
                    self.memory.clear();
                    self.cache.invalidate();
                    self.state = RasterizerState::ClearEnd;
                }
            }
            RasterizerState::Flush => match self.cache.next_dirty() {
                Some(line) => {
                    let (block, data) = self.cache.clean(line);
                    self.write_back(cycle, block, data);
                }
                None => self.state = RasterizerState::End,
            },
            other => panic!("{}: unsupported state {other}", self.name),
        }

        let ready = self.state == RasterizerState::Drawing
            && self.input_q.free() >= 2 * self.cfg.stamps_cycle as usize;
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
            " state = {} | Input = {} | Fetch = {} | Read = {} | Op = {} | Write = {} | Out = {} | Requests = {} | Reserved Lines = {} | Dirty Lines = {}",
            self.state,
            self.input_q.len(),
            self.fetch_q.len(),
            self.read_q.len(),
            self.op_q.len(),
            self.write_q.len(),
            self.term_q.len(),
            self.requests.len(),
            self.cache.reserved(),
            self.cache.dirty()
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn command_list(&self) -> Vec<&'static str> {
        vec![
            "pixel <x> <y> - print the stored depth and stencil of a pixel",
            "blockstate <n> - print the memory state of block n",
        ]
    }

    fn exec_box_command(&mut self, command: &str, args: &[&str]) -> Option<String> {
        let num = |i: usize| args.get(i).and_then(|a| a.parse::<i64>().ok());
        match command {
            "pixel" => Some(match (num(0), num(1)) {
                (Some(x), Some(y)) => match self.word_at(x as i32, y as i32) {
                    Some(w) => format!("({x}, {y}) depth {:#08x} stencil {}", depth_of(w), stencil_of(w)),
                    None => format!("({x}, {y}) is not owned by unit {}", self.unit),
                },
                _ => "usage: pixel <x> <y>".to_string(),
            }),
            "blockstate" => Some(match num(0) {
                Some(b) if (b as usize) < self.memory.blocks() => format!("block {b}: {:?}", self.memory.state(b as u32)),
                _ => "usage: blockstate <n>".to_string(),
            }),
            _ => None,
        }
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let pending = self.state == RasterizerState::Drawing && self.queued() > 0;
        StallStatus::checked(self.progress.stalled(cycle, threshold, pending))
    }

    fn stall_report(&self, cycle: u64) -> String {
        format!(
            "{} stall report for cycle {cycle}\n{}\n FragmentFIFO state = {:?} | CAM = {:?}\n",
            self.name,
            self.get_state(),
            self.output_ready,
            self.cam
        )
    }
}

#[cfg(test)]
mod tests {
    use rsim_core::{BlockLayout, CompareFunction, StencilUpdate};

    use super::*;

    struct Bench {
        zst: ZStencilTest,
        ports: ZStencilPorts,
        cycle: u64,
        out: Vec<Stamp>,
        updates: Vec<HzUpdate>,
    }

    fn stamp(x: i32, y: i32, z: u32) -> Stamp {
        let mut s = Stamp::new(TriangleId(7), x, y);
        for f in s.fragments.iter_mut() {
            f.z = z;
            f.inside = true;
            f.culled = false;
        }
        s
    }

    impl Bench {
        fn with(cfg: ZStencilConfig, state_dir: Option<PathBuf>, dump_dir: Option<PathBuf>) -> Self {
            let ports = ZStencilPorts::new(&cfg, 0);
            let mapper = PixelMapper::new(BlockLayout::new(64, 64, 8), 1);
            let mut b = Self {
                zst: ZStencilTest::new("ZStencilTest0", cfg, ports.clone(), mapper, 0, state_dir, dump_dir),
                ports,
                cycle: 0,
                out: Vec::new(),
                updates: Vec::new(),
            };
            b.step();
            b
        }

        fn new(cfg: ZStencilConfig) -> Self {
            Self::with(cfg, None, None)
        }

        fn step(&mut self) {
            self.ports.output_state.write(self.cycle, UnitState::Ready);
            self.zst.clock(self.cycle);
            self.cycle += 1;
            self.out.extend(self.ports.output.read_up_to(self.cycle, usize::MAX));
            self.updates.extend(self.ports.hz_update.read_up_to(self.cycle, usize::MAX));
        }

        fn command(&mut self, c: RasterizerCommand) {
            self.ports.command.write(self.cycle, c);
            self.step();
            self.step();
        }

        fn reg(&mut self, reg: GpuRegister, data: GpuRegData) {
            self.command(RasterizerCommand::write(reg, 0, data));
        }

        /// Run until the state is reached, returning the cycles it took.
        fn run_until(&mut self, state: RasterizerState) -> u64 {
            let start = self.cycle;
            while self.zst.state() != state {
                self.step();
                assert!(self.cycle - start < 10_000, "stuck: {}", self.zst.get_state());
            }
            self.cycle - start
        }

        fn draw(&mut self, mut stamps: Vec<Stamp>) -> u64 {
            if let Some(last) = stamps.last_mut() {
                last.last = true;
            }
            self.command(RasterizerCommand::Draw);
            let start = self.cycle;
            let mut input: VecDeque<Stamp> = stamps.into();
            let mut ready = false;
            while self.zst.state() != RasterizerState::End {
                if ready {
                    if let Some(s) = input.pop_front() {
                        self.ports.input.write(self.cycle, s);
                    }
                }
                self.step();
                ready = self.ports.input_state.read_latest(self.cycle) == Some(UnitState::Ready);
                assert!(self.cycle - start < 10_000, "draw stuck: {}", self.zst.get_state());
            }
            let cycles = self.cycle - start;
            self.command(RasterizerCommand::End);
            cycles
        }
    }

    fn depth_on(b: &mut Bench) {
        b.reg(GpuRegister::DepthTest, GpuRegData::Bool(true));
    }

    #[test]
    fn hidden_stamp_is_culled() {
        let mut b = Bench::new(ZStencilConfig::default());
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 100), stamp(0, 0, 200)]);
        assert_eq!(b.out.len(), 2);
        assert_eq!(b.out[0].live_fragments(), 4);
        assert!(b.out[1].all_culled());
        let s = b.zst.statistics();
        assert_eq!((s.get("passed"), s.get("failed"), s.get("culled")), (4, 4, 1));
        assert_eq!(depth_of(b.zst.word_at(1, 1).unwrap()), 100);
    }

    #[test]
    fn same_quad_is_read_after_write() {
        let mut b = Bench::new(ZStencilConfig::default());
        depth_on(&mut b);
        b.draw(vec![stamp(2, 2, 300), stamp(2, 2, 200), stamp(2, 2, 100)]);
        assert!(b.out.iter().all(|s| s.live_fragments() == 4));
        assert!(b.zst.statistics().get("raw_stalls") > 0);
        assert_eq!(depth_of(b.zst.word_at(3, 3).unwrap()), 100);
    }

    #[test]
    fn untested_stamps_skip_the_cache() {
        let mut b = Bench::new(ZStencilConfig::default());
        b.draw(vec![stamp(0, 0, 5), stamp(8, 0, 5)]);
        let s = b.zst.statistics();
        assert_eq!(s.get("hits") + s.get("misses"), 0);
        assert_eq!(s.get("outputs"), 2);
    }

    #[test]
    fn flush_writes_back_compresses_and_refreshes_hz() {
        let mut b = Bench::new(ZStencilConfig::default());
        depth_on(&mut b);
        let block: Vec<Stamp> = (0..4)
            .flat_map(|y| (0..4).map(move |x| stamp(2 * x, 2 * y, 1000 + x as u32)))
            .collect();
        b.draw(block);
        b.command(RasterizerCommand::Flush);
        b.run_until(RasterizerState::End);
        for _ in 0..20 {
            b.step();
        }
        assert_eq!(b.zst.memory().state(0), BlockState::Compressed(0));
        assert_eq!(b.updates, vec![HzUpdate { block: 0, z: 1003 }]);
        assert_eq!(b.zst.statistics().get("comp_level0"), 1);
    }

    #[test]
    fn disabled_hz_update_sends_nothing() {
        let cfg = ZStencilConfig {
            disable_hz_update: true,
            ..ZStencilConfig::default()
        };
        let mut b = Bench::new(cfg);
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 10)]);
        b.command(RasterizerCommand::Flush);
        b.run_until(RasterizerState::End);
        for _ in 0..20 {
            b.step();
        }
        assert!(b.updates.is_empty());
        assert_eq!(b.zst.statistics().get("writebacks"), 1);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let cfg = ZStencilConfig {
            cache_ways: 1,
            cache_lines: 1,
            ..ZStencilConfig::default()
        };
        let mut b = Bench::new(cfg);
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 10), stamp(8, 0, 10), stamp(0, 0, 5)]);
        let s = b.zst.statistics();
        assert_eq!(s.get("misses"), 3);
        assert_eq!(s.get("writebacks"), 2);
        // Block 0 came back from memory, not from the clear value.
        assert_eq!(s.get("reads"), 1);
        assert_eq!(depth_of(b.zst.word_at(0, 0).unwrap()), 5);
    }

    #[test]
    fn one_request_slot_serializes_misses() {
        let stamps = |z| (0..4).map(|i| stamp(8 * i, 0, z)).collect::<Vec<_>>();
        let mut timings = Vec::new();
        for requests in [8, 1] {
            let cfg = ZStencilConfig {
                cache_request_queue: requests,
                memory_latency: 40,
                ..ZStencilConfig::default()
            };
            let mut b = Bench::new(cfg);
            depth_on(&mut b);
            b.draw(stamps(50));
            b.command(RasterizerCommand::Flush);
            b.run_until(RasterizerState::End);
            b.command(RasterizerCommand::End);
            // Every block is in memory now, so the second draw misses to it.
            b.zst.cache.invalidate();
            timings.push(b.draw(stamps(40)));
        }
        assert!(timings[1] > timings[0] + 40, "{timings:?}");
    }

    #[test]
    fn clear_resets_blocks_after_block_cycles() {
        let cfg = ZStencilConfig {
            clear_blocks_cycle: 16,
            ..ZStencilConfig::default()
        };
        let mut b = Bench::new(cfg);
        depth_on(&mut b);
        b.reg(GpuRegister::ZBufferClear, GpuRegData::Uint(0x1234));
        b.draw(vec![stamp(0, 0, 10)]);
        b.ports.command.write(b.cycle, RasterizerCommand::ClearZStencil);
        b.step();
        // One cycle to take the command, four to clear 64 blocks.
        assert_eq!(b.run_until(RasterizerState::ClearEnd), 5);
        assert_eq!(depth_of(b.zst.word_at(0, 0).unwrap()), 0x1234);
        assert_eq!(b.zst.memory().state(0), BlockState::Clear);
    }

    #[test]
    fn stencil_only_pass_writes_reference() {
        let mut b = Bench::new(ZStencilConfig::default());
        b.reg(GpuRegister::StencilTest, GpuRegData::Bool(true));
        b.reg(GpuRegister::StencilReference, GpuRegData::Uint(9));
        b.reg(GpuRegister::DepthPass, GpuRegData::Stencil(StencilUpdate::Replace));
        b.draw(vec![stamp(4, 4, 1)]);
        assert_eq!(stencil_of(b.zst.word_at(5, 4).unwrap()), 9);
        assert_eq!(b.zst.registers().stencil_function, CompareFunction::Always);
    }

    #[test]
    fn validation_records_each_quad() {
        let cfg = ZStencilConfig {
            validation: true,
            ..ZStencilConfig::default()
        };
        let mut b = Bench::new(cfg);
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 10), stamp(2, 0, 20)]);
        let log = b.zst.take_validation_log();
        assert_eq!(log.len(), 2);
        let first = &log[&FragmentId { triangle: TriangleId(7), x: 0, y: 0 }];
        assert_eq!(first.read, vec![DEPTH_MASK; 4]);
        assert_eq!(first.written, vec![10; 4]);
        assert!(first.mask.iter().all(|&m| m));
        assert!(b.zst.validation_log().is_empty());
    }

    #[test]
    fn block_states_survive_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = Bench::with(ZStencilConfig::default(), Some(dir.path().to_path_buf()), None);
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 10)]);
        b.command(RasterizerCommand::Flush);
        b.run_until(RasterizerState::End);
        b.command(RasterizerCommand::End);
        let saved = b.zst.memory().states().to_vec();
        assert_ne!(saved[0], BlockState::Clear);

        b.command(RasterizerCommand::SaveState);
        b.command(RasterizerCommand::End);
        b.command(RasterizerCommand::ResetState);
        assert_eq!(b.zst.memory().state(0), BlockState::Clear);
        b.command(RasterizerCommand::End);
        b.command(RasterizerCommand::RestoreState);
        assert_eq!(b.zst.memory().states(), saved.as_slice());
        assert!(dir.path().join("zst_block_state_0.bin").exists());
    }

    #[test]
    #[should_panic(expected = "ZStencilTest0: restoring block states from")]
    fn restore_from_missing_file_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = Bench::with(ZStencilConfig::default(), Some(dir.path().join("missing")), None);
        b.command(RasterizerCommand::RestoreState);
    }

    #[test]
    fn depth_dump_is_a_png_of_the_screen() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = Bench::with(ZStencilConfig::default(), None, Some(dir.path().to_path_buf()));
        depth_on(&mut b);
        b.draw(vec![stamp(0, 0, 0)]);
        b.command(RasterizerCommand::DumpDepth);
        let path = dir.path().join("depth_unit0_0000.png");
        let img = image::open(&path).unwrap().to_luma8();
        assert_eq!(img.dimensions(), (64, 64));
        assert_eq!(img.get_pixel(0, 0).0, [0]);
        assert_eq!(img.get_pixel(40, 40).0, [0xff]);
    }
}
