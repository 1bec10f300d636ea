//! Attribute interpolator box.
//!
//! Stamps from FragmentFIFO are held for `cycles_fragment` cycles (one
//! cycle per `interpolators` active attributes) plus the pipeline latency
//! and returned in arrival order. Markers pass through untouched.

use rsim_core::command::unsupported;
use rsim_core::config::InterpolatorConfig;
use rsim_core::stage::ProgressMonitor;
use rsim_core::stamp::MAX_FRAGMENT_ATTRIBUTES;
use rsim_core::{
    GpuRegData, GpuRegister, PipelineStage, RasterizerCommand, RasterizerState, Signal, Stamp,
    StallStatus, Statistics, UnitState,
};
use rsim_emulator::{AttributeSet, RasterizerEmulator, SharedEmulator};

#[derive(Debug, Clone)]
pub struct InterpolatorPorts {
    pub command: Signal<RasterizerCommand>,
    pub state: Signal<RasterizerState>,
    /// Stamps from FragmentFIFO.
    pub input: Signal<Stamp>,
    /// Readiness towards FragmentFIFO.
    pub input_state: Signal<UnitState>,
    /// Interpolated stamps back to FragmentFIFO.
    pub output: Signal<Stamp>,
}

impl InterpolatorPorts {
    pub fn new(cfg: &InterpolatorConfig) -> Self {
        Self {
            command: Signal::state("RasterizerToInterpolator"),
            state: Signal::state("InterpolatorState"),
            input: Signal::new("FragmentFIFOToInterpolator", cfg.stamps_cycle, 1),
            input_state: Signal::state("InterpolatorToFragmentFIFOState"),
            output: Signal::new("InterpolatorToFragmentFIFO", cfg.stamps_cycle, 1),
        }
    }
}

pub struct Interpolator {
    name: String,
    cfg: InterpolatorConfig,
    ports: InterpolatorPorts,
    emu: SharedEmulator,
    units: usize,
    state: RasterizerState,

    attributes: AttributeSet,
    cycles_fragment: u32,
    remaining: u32,
    pipeline: Signal<Stamp>,
    in_flight: usize,
    last_seen: usize,

    stats: Statistics,
    progress: ProgressMonitor,
}

impl Interpolator {
    pub fn new(name: impl Into<String>, cfg: InterpolatorConfig, ports: InterpolatorPorts, emu: SharedEmulator, units: usize) -> Self {
        let attributes = AttributeSet::default();
        let cycles_fragment = Self::cycles_for(&cfg, &attributes);
        Self {
            name: name.into(),
            pipeline: Signal::new("InterpolationPipeline", cfg.stamps_cycle, cycles_fragment as u64 + cfg.latency),
            cfg,
            ports,
            emu,
            units,
            state: RasterizerState::Reset,
            attributes,
            cycles_fragment,
            remaining: 0,
            in_flight: 0,
            last_seen: 0,
            stats: Statistics::with_counters(&["inputs", "outputs", "fragments", "attributes"]),
            progress: ProgressMonitor::default(),
        }
    }

    pub fn ports(&self) -> &InterpolatorPorts {
        &self.ports
    }

    pub fn cycles_fragment(&self) -> u32 {
        self.cycles_fragment
    }

    fn cycles_for(cfg: &InterpolatorConfig, attributes: &AttributeSet) -> u32 {
        attributes.active_count().div_ceil(cfg.interpolators).max(1)
    }

    fn process_command(&mut self, command: RasterizerCommand) {
        match (self.state, command) {
            (_, RasterizerCommand::Reset) => self.state = RasterizerState::Reset,
            (RasterizerState::Ready, RasterizerCommand::Draw) => {
                self.cycles_fragment = Self::cycles_for(&self.cfg, &self.attributes);
                self.pipeline = Signal::new(
                    "InterpolationPipeline",
                    self.cfg.stamps_cycle,
                    self.cycles_fragment as u64 + self.cfg.latency,
                );
                self.remaining = 0;
                self.in_flight = 0;
                self.last_seen = 0;
                log::debug!("{}: draw with {} cycles per fragment", self.name, self.cycles_fragment);
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
        let slot = subreg as usize;
        match reg {
            GpuRegister::DepthPrecision => {}
            GpuRegister::FragmentInputAttributes if slot < MAX_FRAGMENT_ATTRIBUTES => {
                self.attributes.active[slot] = data.as_bool()
            }
            GpuRegister::Interpolation if slot < MAX_FRAGMENT_ATTRIBUTES => {
                self.attributes.interpolated[slot] = data.as_bool()
            }
            other => panic!("{}: unsupported register {other:?} [{subreg}]", self.name),
        }
    }

    fn draw_cycle(&mut self, cycle: u64) {
        while let Some(stamp) = self.pipeline.read(cycle) {
            self.in_flight -= 1;
            if stamp.last {
                self.last_seen += 1;
            }
            if !stamp.marker {
                self.stats.inc("outputs");
            }
            self.ports.output.write(cycle, stamp);
            self.progress.note(cycle);
        }

        if self.remaining > 0 {
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            let mut accepted = 0;
            while accepted < self.cfg.stamps_cycle {
                let Some(mut stamp) = self.ports.input.read(cycle) else {
                    break;
                };
                if !stamp.marker {
                    let live = stamp.live_fragments() as u64;
                    self.emu.borrow().interpolate(&mut stamp, &self.attributes);
                    self.stats.inc("inputs");
                    self.stats.add("fragments", live);
                    self.stats.add("attributes", live * self.attributes.active_count() as u64);
                }
                self.pipeline.write(cycle, stamp);
                self.in_flight += 1;
                accepted += 1;
            }
            if accepted > 0 {
                self.remaining = self.cycles_fragment;
                self.progress.note(cycle);
            }
        }

        if self.last_seen == self.units && self.in_flight == 0 {
            log::debug!("{} cycle {cycle}: end of draw", self.name);
            self.state = RasterizerState::End;
        }
    }
}

impl PipelineStage for Interpolator {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock(&mut self, cycle: u64) {
        match self.state {
            RasterizerState::Reset => {
                self.attributes = AttributeSet::default();
                self.pipeline.clear();
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
                    self.draw_cycle(cycle);
                }
            }
            other => panic!("{}: unsupported state {other}", self.name),
        }
        let ready = self.state == RasterizerState::Drawing
            && self.remaining <= 1
            && self.ports.input.is_idle();
        let input_state = if ready { UnitState::Ready } else { UnitState::Busy };
        self.ports.input_state.write(cycle, input_state);
        self.ports.state.write(cycle, self.state);
    }

    fn state(&self) -> RasterizerState {
        self.state
    }

    fn get_state(&self) -> String {
        format!(
            " state = {} | Cycles Fragment = {} | Remaining = {} | In Flight = {} | Last Stamps = {}/{}",
            self.state, self.cycles_fragment, self.remaining, self.in_flight, self.last_seen, self.units
        )
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn detect_stall(&self, cycle: u64, threshold: u64) -> StallStatus {
        let pending = self.state == RasterizerState::Drawing && self.in_flight > 0;
        StallStatus::checked(self.progress.stalled(cycle, threshold, pending))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rsim_core::primitive::Vertex;
    use rsim_core::stamp::COLOR_ATTRIBUTE;
    use rsim_emulator::EdgeEmulator;

    use super::*;

    fn bench(cfg: InterpolatorConfig, units: usize) -> (Interpolator, InterpolatorPorts, Rc<RefCell<EdgeEmulator>>) {
        let emu = Rc::new(RefCell::new(EdgeEmulator::new(32, 32)));
        let ports = InterpolatorPorts::new(&cfg);
        let shared: SharedEmulator = emu.clone();
        let int = Interpolator::new("Interpolator", cfg, ports.clone(), shared, units);
        (int, ports, emu)
    }

    #[test]
    fn cycles_follow_active_attributes() {
        let cfg = InterpolatorConfig {
            interpolators: 2,
            ..InterpolatorConfig::default()
        };
        let mut attrs = AttributeSet::default();
        assert_eq!(Interpolator::cycles_for(&cfg, &attrs), 1);
        attrs.active = [true; MAX_FRAGMENT_ATTRIBUTES];
        assert_eq!(Interpolator::cycles_for(&cfg, &attrs), 4);
        attrs.active = [false; MAX_FRAGMENT_ATTRIBUTES];
        assert_eq!(Interpolator::cycles_for(&cfg, &attrs), 1);
    }

    #[test]
    fn stamps_leave_in_order_and_interpolated() {
        let (mut int, ports, emu) = bench(InterpolatorConfig::default(), 1);
        let color = [0.0, 1.0, 0.0, 1.0];
        let id = emu.borrow_mut().setup_triangle(&[
            Vertex::at(0.0, 0.0, 0.5).with_attribute(COLOR_ATTRIBUTE, color),
            Vertex::at(16.0, 0.0, 0.5).with_attribute(COLOR_ATTRIBUTE, color),
            Vertex::at(0.0, 16.0, 0.5).with_attribute(COLOR_ATTRIBUTE, color),
        ]);
        int.clock(0);
        ports.command.write(0, RasterizerCommand::Draw);
        int.clock(1);

        let mut cycle = 2;
        let mut sent = 0;
        let mut out = Vec::new();
        while int.state() != RasterizerState::End {
            assert!(cycle < 500, "interpolator never finished");
            if sent < 5 && ports.input_state.read_latest(cycle) == Some(UnitState::Ready) {
                let mut s = emu.borrow().generate_stamp(id, 2 * sent, 0, 1);
                s.sequence = sent as u64;
                s.last = sent == 4;
                ports.input.write(cycle, s);
                sent += 1;
            }
            int.clock(cycle);
            out.extend(ports.output.read_up_to(cycle + 1, 8));
            cycle += 1;
        }
        let order: Vec<u64> = out.iter().map(|s| s.sequence).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!((out[0].attributes[0][COLOR_ATTRIBUTE][1] - 1.0).abs() < 1e-5);
        assert_eq!(int.statistics().get("outputs"), 5);
    }

    #[test]
    fn end_waits_for_every_unit() {
        let (mut int, ports, _emu) = bench(InterpolatorConfig::default(), 2);
        int.clock(0);
        ports.command.write(0, RasterizerCommand::Draw);
        int.clock(1);
        ports.input.write(1, Stamp::end_marker(0, 0));
        for c in 2..40 {
            int.clock(c);
        }
        assert_eq!(int.state(), RasterizerState::Drawing);
        ports.input.write(40, Stamp::end_marker(1, 1));
        for c in 41..80 {
            int.clock(c);
        }
        assert_eq!(int.state(), RasterizerState::End);
        assert_eq!(int.statistics().get("outputs"), 0);
    }
}
