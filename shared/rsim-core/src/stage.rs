//! Common interface of every pipeline box.

use crate::command::RasterizerState;
use crate::stats::Statistics;

/// Readiness a consumer reports to its producer on a state signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitState {
    Ready,
    #[default]
    Busy,
    /// Ready and holding no work at all (vertex traffic only).
    Empty,
}

impl UnitState {
    pub fn accepts(self) -> bool {
        matches!(self, Self::Ready | Self::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StallStatus {
    /// The box implements stall detection at all.
    pub detection_implemented: bool,
    pub stalled: bool,
}

impl StallStatus {
    pub fn checked(stalled: bool) -> Self {
        Self {
            detection_implemented: true,
            stalled,
        }
    }
}

/// Last-progress bookkeeping used by stall detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressMonitor {
    last: u64,
}

impl ProgressMonitor {
    pub fn note(&mut self, cycle: u64) {
        self.last = cycle;
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Work is pending but nothing moved for more than `threshold` cycles.
    pub fn stalled(&self, cycle: u64, threshold: u64, pending: bool) -> bool {
        pending && cycle.saturating_sub(self.last) > threshold
    }
}

/// A cycle-stepped simulation box.
///
/// `clock` is called exactly once per simulated cycle. Everything else is
/// introspection and never changes simulated behaviour.
pub trait PipelineStage {
    fn name(&self) -> &str;

    fn clock(&mut self, cycle: u64);

    fn state(&self) -> RasterizerState;

    /// Single-line status dump.
    fn get_state(&self) -> String;

    fn statistics(&self) -> &Statistics;

    /// Box-specific console commands, as `"name - description"` lines.
    fn command_list(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Run a box-specific console command. `None` when the command is unknown.
    fn exec_box_command(&mut self, _command: &str, _args: &[&str]) -> Option<String> {
        None
    }

    /// Debug console entry point.
    fn exec_command(&mut self, line: &str) -> String {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return String::new();
        };
        let args: Vec<&str> = words.collect();
        match command {
            "help" => {
                let mut out = String::from("help - list commands\nstate - print box state\nstats - print counters\n");
                for c in self.command_list() {
                    out.push_str(c);
                    out.push('\n');
                }
                out
            }
            "state" => self.get_state(),
            "stats" => self.statistics().to_string(),
            other => self
                .exec_box_command(other, &args)
                .unwrap_or_else(|| format!("{}: unknown command '{other}'", self.name())),
        }
    }

    fn detect_stall(&self, _cycle: u64, _threshold: u64) -> StallStatus {
        StallStatus::default()
    }

    fn stall_report(&self, cycle: u64) -> String {
        format!("{} stall report for cycle {cycle}\n{}\n", self.name(), self.get_state())
    }
}
