//! Collaborators that surround the Rasterizer in a GPU: the command
//! processor, the vertex streamer / primitive assembly, the unified shader
//! units and the color write units.
//!
//! They are deliberately simple. Each one honours the same signal protocol
//! as a real box (state feedback, bandwidth, admission), so the Rasterizer
//! sees realistic back-pressure, but none of them models internal timing
//! beyond a latency.

use std::collections::{BTreeMap, VecDeque};

use rsim_core::primitive::{SetupInput, ShaderPayload, ShaderWork, Vertex, VertexInput};
use rsim_core::stamp::{Quad, COLOR_ATTRIBUTE};
use rsim_core::{RasterizerCommand, RasterizerState, Signal, Stamp, Statistics, UnitState};

use crate::scene::{DrawCall, Scene, SceneOp};

/// Parameters of the bench collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Fixed part of the shader latency.
    pub shader_latency: u64,
    /// Largest input-dependent addition to the shader latency.
    pub shader_jitter: u64,
    /// Inputs a shader unit holds at once.
    pub shader_queue: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            shader_latency: 8,
            shader_jitter: 8,
            shader_queue: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Command sent at the given cycle, waiting for its outcome.
    Issued(u64),
    /// `End` sent at the given cycle, waiting for READY.
    Closing(u64),
}

/// Cycles before a state read reflects a command: one for the command to
/// arrive, one for the state to come back.
const ROUND_TRIP: u64 = 2;

/// Plays a [`Scene`] into the Rasterizer one command at a time.
pub struct CommandProcessor {
    command: Signal<RasterizerCommand>,
    state: Signal<RasterizerState>,
    ops: VecDeque<SceneOp>,
    rast_state: RasterizerState,
    phase: Phase,
    stats: Statistics,
}

impl CommandProcessor {
    pub fn new(command: Signal<RasterizerCommand>, state: Signal<RasterizerState>) -> Self {
        Self {
            command,
            state,
            ops: VecDeque::from([SceneOp::Command(RasterizerCommand::Reset)]),
            rast_state: RasterizerState::Reset,
            phase: Phase::Idle,
            stats: Statistics::with_counters(&["commands", "draws", "ends"]),
        }
    }

    /// Queue the scene's operations. A new processor starts with a Reset.
    pub fn load(&mut self, scene: &Scene) {
        self.ops.extend(scene.ops.iter().cloned());
    }

    /// Script played out and the Rasterizer back in READY.
    pub fn is_done(&self) -> bool {
        self.ops.is_empty() && self.phase == Phase::Idle
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn clock(&mut self, cycle: u64, streamer: &mut Streamer) {
        if let Some(s) = self.state.read_latest(cycle) {
            self.rast_state = s;
        }
        match self.phase {
            Phase::Idle => {
                let Some(op) = self.ops.pop_front() else {
                    return;
                };
                let command = match op {
                    SceneOp::Command(c) => c,
                    SceneOp::Draw(draw) => {
                        streamer.load(draw);
                        self.stats.inc("draws");
                        RasterizerCommand::Draw
                    }
                };
                log::debug!("CommandProcessor cycle {cycle}: {command:?}");
                self.command.write(cycle, command);
                self.stats.inc("commands");
                self.phase = Phase::Issued(cycle);
            }
            Phase::Issued(at) if cycle >= at + ROUND_TRIP => {
                if self.rast_state.is_finished() {
                    self.command.write(cycle, RasterizerCommand::End);
                    self.stats.inc("ends");
                    self.phase = Phase::Closing(cycle);
                } else if self.rast_state == RasterizerState::Ready {
                    self.phase = Phase::Idle;
                }
            }
            Phase::Closing(at) if cycle >= at + ROUND_TRIP && self.rast_state == RasterizerState::Ready => {
                self.phase = Phase::Idle;
            }
            _ => {}
        }
    }
}

/// Vertex fetch and primitive assembly for one draw at a time.
///
/// Vertices go to the FragmentFIFO for shading; triangles are handed to
/// TriangleSetup once all three of their vertices have come back.
pub struct Streamer {
    vertex_input: Signal<VertexInput>,
    vertex_state: Signal<UnitState>,
    vertex_output: Signal<VertexInput>,
    setup_input: Signal<SetupInput>,
    setup_request: Signal<u32>,

    draw: DrawCall,
    to_send: VecDeque<VertexInput>,
    shaded: Vec<Option<Vertex>>,
    next_triangle: usize,
    granted: u32,
    vertex_ready: bool,
    end_sent: bool,
    stats: Statistics,
}

impl Streamer {
    pub fn new(
        vertex_input: Signal<VertexInput>,
        vertex_state: Signal<UnitState>,
        vertex_output: Signal<VertexInput>,
        setup_input: Signal<SetupInput>,
        setup_request: Signal<u32>,
    ) -> Self {
        Self {
            vertex_input,
            vertex_state,
            vertex_output,
            setup_input,
            setup_request,
            draw: DrawCall::new(),
            to_send: VecDeque::new(),
            shaded: Vec::new(),
            next_triangle: 0,
            granted: 0,
            vertex_ready: false,
            end_sent: true,
            stats: Statistics::with_counters(&["vertices", "shaded_vertices", "triangles"]),
        }
    }

    pub fn load(&mut self, draw: DrawCall) {
        let n = draw.vertices.len();
        self.to_send = draw
            .vertices
            .iter()
            .enumerate()
            .map(|(i, v)| VertexInput {
                index: i as u32,
                vertex: *v,
                last: i + 1 == n,
            })
            .collect();
        self.shaded = vec![None; n];
        self.next_triangle = 0;
        self.granted = 0;
        self.end_sent = false;
        self.draw = draw;
    }

    /// Every triangle (or the end marker of an empty draw) handed over.
    pub fn is_idle(&self) -> bool {
        self.to_send.is_empty() && self.next_triangle == self.draw.triangles.len() && self.end_sent
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Triangle `i` once all its vertices are shaded.
    fn assemble(&self, i: usize) -> Option<[Vertex; 3]> {
        let [a, b, c] = *self.draw.triangles.get(i)?;
        Some([self.shaded[a as usize]?, self.shaded[b as usize]?, self.shaded[c as usize]?])
    }

    pub fn clock(&mut self, cycle: u64) {
        if let Some(s) = self.vertex_state.read_latest(cycle) {
            self.vertex_ready = s.accepts();
        }
        if self.vertex_ready {
            for _ in 0..self.vertex_input.bandwidth() {
                let Some(v) = self.to_send.pop_front() else {
                    break;
                };
                self.vertex_input.write(cycle, v);
                self.stats.inc("vertices");
            }
        }

        for v in self.vertex_output.read_up_to(cycle, usize::MAX) {
            match self.shaded.get_mut(v.index as usize) {
                Some(slot) => *slot = Some(v.vertex),
                None => panic!("Streamer: shaded vertex {} does not belong to the draw", v.index),
            }
            self.stats.inc("shaded_vertices");
        }

        while let Some(n) = self.setup_request.read(cycle) {
            self.granted += n;
        }
        let mut sent = 0;
        while self.granted > 0 && sent < self.setup_input.bandwidth() {
            let total = self.draw.triangles.len();
            let input = if total == 0 {
                if self.end_sent {
                    break;
                }
                self.end_sent = true;
                SetupInput {
                    index: 0,
                    vertices: None,
                    last: true,
                }
            } else if let Some(vertices) = self.assemble(self.next_triangle) {
                let index = self.next_triangle as u32;
                self.next_triangle += 1;
                let last = self.next_triangle == total;
                self.end_sent = last;
                SetupInput {
                    index,
                    vertices: Some(vertices),
                    last,
                }
            } else {
                break;
            };
            log::trace!("Streamer cycle {cycle}: triangle {} to setup", input.index);
            self.setup_input.write(cycle, input);
            self.stats.inc("triangles");
            self.granted -= 1;
            sent += 1;
        }
    }
}

/// A unified shader unit running a pass-through program.
///
/// Inputs complete after `shader_latency` plus a position-dependent
/// jitter, so neighbouring work finishes out of order.
pub struct ShaderUnit {
    name: String,
    input: Signal<ShaderWork>,
    state: Signal<UnitState>,
    output: Signal<ShaderWork>,
    queue: Vec<(u64, ShaderWork)>,
    capacity: usize,
    latency: u64,
    jitter: u64,
    stats: Statistics,
}

impl ShaderUnit {
    pub fn new(
        name: impl Into<String>,
        cfg: &BenchConfig,
        input: Signal<ShaderWork>,
        state: Signal<UnitState>,
        output: Signal<ShaderWork>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            state,
            output,
            queue: Vec::with_capacity(cfg.shader_queue),
            capacity: cfg.shader_queue,
            latency: cfg.shader_latency,
            jitter: cfg.shader_jitter,
            stats: Statistics::with_counters(&["inputs", "outputs", "vertices", "triangles", "fragments"]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    fn latency_of(&self, work: &ShaderWork) -> u64 {
        let key = match &work.payload {
            ShaderPayload::Fragment(s) => (s.x.unsigned_abs() / 2 + s.y.unsigned_abs() / 2) as u64,
            ShaderPayload::Vertex(v) => v.index as u64,
            ShaderPayload::Triangle(_) => 0,
        };
        self.latency + (key * 5) % (self.jitter + 1)
    }

    pub fn clock(&mut self, cycle: u64) {
        for work in self.input.read_up_to(cycle, usize::MAX) {
            if self.queue.len() >= self.capacity {
                panic!("{}: input while holding {} items", self.name, self.queue.len());
            }
            match &work.payload {
                ShaderPayload::Vertex(_) => self.stats.inc("vertices"),
                ShaderPayload::Triangle(_) => self.stats.inc("triangles"),
                ShaderPayload::Fragment(_) => self.stats.inc("fragments"),
            }
            self.stats.inc("inputs");
            let ready = cycle + self.latency_of(&work);
            self.queue.push((ready, work));
        }

        for _ in 0..self.output.bandwidth() {
            let due = self
                .queue
                .iter()
                .enumerate()
                .filter(|(_, (ready, _))| *ready <= cycle)
                .min_by_key(|(_, (ready, _))| *ready)
                .map(|(i, _)| i);
            let Some(i) = due else {
                break;
            };
            let (_, work) = self.queue.remove(i);
            self.output.write(cycle, work);
            self.stats.inc("outputs");
        }

        let room = self.capacity - self.queue.len();
        let ready = room >= 2 * self.input.bandwidth() as usize;
        self.state.write(cycle, if ready { UnitState::Ready } else { UnitState::Busy });
    }
}

/// Color write unit of one stamp unit: keeps the last color written to
/// each pixel.
pub struct ColorWriteSink {
    unit: usize,
    input: Signal<Stamp>,
    state: Signal<UnitState>,
    colors: BTreeMap<(i32, i32), Quad>,
    busy_until: u64,
    stats: Statistics,
}

impl ColorWriteSink {
    pub fn new(unit: usize, input: Signal<Stamp>, state: Signal<UnitState>) -> Self {
        Self {
            unit,
            input,
            state,
            colors: BTreeMap::new(),
            busy_until: 0,
            stats: Statistics::with_counters(&["stamps", "fragments", "markers", "lasts"]),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Report BUSY and take nothing until `cycle`.
    pub fn set_busy_until(&mut self, cycle: u64) {
        self.busy_until = cycle;
    }

    pub fn colors(&self) -> &BTreeMap<(i32, i32), Quad> {
        &self.colors
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn clock(&mut self, cycle: u64) {
        let busy = cycle < self.busy_until;
        self.state.write(cycle, if busy { UnitState::Busy } else { UnitState::Ready });
        if busy {
            return;
        }
        for stamp in self.input.read_up_to(cycle, usize::MAX) {
            if stamp.unit != self.unit {
                panic!("ColorWrite{}: stamp for unit {} delivered here", self.unit, stamp.unit);
            }
            if stamp.last {
                self.stats.inc("lasts");
            }
            if stamp.marker {
                self.stats.inc("markers");
                continue;
            }
            self.stats.inc("stamps");
            for (f, attributes) in stamp.fragments.iter().zip(stamp.attributes.iter()) {
                if f.is_live() {
                    self.colors.insert((f.x, f.y), attributes[COLOR_ATTRIBUTE]);
                    self.stats.inc("fragments");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rsim_core::primitive::ShaderTag;
    use rsim_core::{Slot, TriangleId};

    use super::*;

    fn fragment_work(x: i32, y: i32, sequence: u64) -> ShaderWork {
        let mut s = Stamp::new(TriangleId(0), x, y);
        s.sequence = sequence;
        ShaderWork {
            tag: ShaderTag::Fragment {
                unit: 0,
                entry: Slot {
                    index: sequence as usize,
                    sequence,
                },
            },
            payload: ShaderPayload::Fragment(Box::new(s)),
        }
    }

    fn sequence(w: &ShaderWork) -> u64 {
        match &w.payload {
            ShaderPayload::Fragment(s) => s.sequence,
            _ => unreachable!(),
        }
    }

    #[test]
    fn shader_completes_out_of_order_and_reports_room() {
        let cfg = BenchConfig {
            shader_latency: 2,
            shader_jitter: 10,
            shader_queue: 6,
        };
        let input = Signal::new("in", 2, 1);
        let state = Signal::state("state");
        let output = Signal::new("out", 2, 1);
        let mut shader = ShaderUnit::new("Shader0", &cfg, input.clone(), state.clone(), output.clone());

        input.write(0, fragment_work(4, 0, 0));
        input.write(0, fragment_work(0, 0, 1));
        shader.clock(1);
        // Four slots left: exactly the admission limit.
        assert_eq!(state.read_latest(2), Some(UnitState::Ready));
        input.write(1, fragment_work(2, 2, 2));
        shader.clock(2);
        assert_eq!(state.read_latest(3), Some(UnitState::Busy));

        let mut order = Vec::new();
        for c in 3..40 {
            shader.clock(c);
            order.extend(output.read_up_to(c + 1, usize::MAX).iter().map(sequence));
        }
        assert_eq!(order, vec![1, 0, 2]);
        assert_eq!(shader.statistics().get("outputs"), 3);
    }

    #[test]
    fn empty_draw_sends_a_single_end_marker() {
        let setup_input = Signal::new("setup", 1, 1);
        let request = Signal::state("request");
        let mut streamer = Streamer::new(
            Signal::new("vin", 1, 1),
            Signal::state("vstate"),
            Signal::new("vout", 1, 1),
            setup_input.clone(),
            request.clone(),
        );
        streamer.load(DrawCall::new());
        assert!(!streamer.is_idle());
        request.write(0, 2);
        streamer.clock(1);
        streamer.clock(2);
        let sent = setup_input.read_up_to(3, usize::MAX);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].vertices.is_none() && sent[0].last);
        assert!(streamer.is_idle());
    }

    #[test]
    fn triangles_wait_for_their_vertices() {
        let vin = Signal::new("vin", 1, 1);
        let vstate = Signal::state("vstate");
        let vout = Signal::new("vout", 4, 1);
        let setup_input = Signal::new("setup", 1, 1);
        let request = Signal::state("request");
        let mut streamer = Streamer::new(vin.clone(), vstate.clone(), vout.clone(), setup_input.clone(), request.clone());
        let draw = DrawCall::new()
            .triangle([Vertex::at(0.0, 0.0, 0.5), Vertex::at(8.0, 0.0, 0.5), Vertex::at(0.0, 8.0, 0.5)]);
        streamer.load(draw);

        vstate.write(0, UnitState::Ready);
        request.write(0, 1);
        for c in 1..4 {
            streamer.clock(c);
        }
        let sent: Vec<VertexInput> = vin.read_up_to(10, usize::MAX);
        assert_eq!(sent.len(), 3);
        assert!(sent[2].last);
        assert!(setup_input.read(10).is_none());

        for v in sent {
            vout.write(4, v);
        }
        streamer.clock(5);
        let t = setup_input.read(6).unwrap();
        assert!(t.last);
        assert_eq!(t.vertices.unwrap()[1].position()[0], 8.0);
        assert!(streamer.is_idle());
    }

    #[test]
    fn busy_color_write_holds_its_input() {
        let input = Signal::new("cw", 1, 1);
        let state = Signal::state("cws");
        let mut cw = ColorWriteSink::new(0, input.clone(), state.clone());
        cw.set_busy_until(5);
        let mut s = Stamp::new(TriangleId(0), 2, 2);
        s.fragments[3].culled = false;
        s.attributes[3][COLOR_ATTRIBUTE] = [0.5, 0.5, 0.5, 1.0];
        s.last = true;
        input.write(0, s);
        for c in 1..5 {
            cw.clock(c);
        }
        assert_eq!(state.read_latest(5), Some(UnitState::Busy));
        assert!(cw.colors().is_empty());
        cw.clock(5);
        assert_eq!(cw.colors().get(&(3, 3)), Some(&[0.5, 0.5, 0.5, 1.0]));
        assert_eq!(cw.statistics().get("fragments"), 1);
        assert_eq!(cw.statistics().get("lasts"), 1);
    }

    #[test]
    fn command_processor_closes_finished_commands() {
        let command = Signal::state("cmd");
        let state = Signal::state("state");
        let mut streamer = Streamer::new(
            Signal::new("vin", 1, 1),
            Signal::state("vstate"),
            Signal::new("vout", 1, 1),
            Signal::new("setup", 1, 1),
            Signal::state("request"),
        );
        let mut cp = CommandProcessor::new(command.clone(), state.clone());
        cp.load(&Scene::new("flush").command(RasterizerCommand::Flush));

        // Play the Rasterizer: READY, then FLUSH -> END -> READY.
        let mut rast = RasterizerState::Ready;
        let mut seen = Vec::new();
        for c in 0..30 {
            state.write(c, rast);
            cp.clock(c, &mut streamer);
            if let Some(cmd) = command.read(c + 1) {
                rast = match cmd {
                    RasterizerCommand::Flush => RasterizerState::End,
                    _ => RasterizerState::Ready,
                };
                seen.push(cmd);
            }
        }
        assert_eq!(seen, vec![RasterizerCommand::Reset, RasterizerCommand::Flush, RasterizerCommand::End]);
        assert!(cp.is_done());
    }
}
