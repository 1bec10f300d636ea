//! Cycle loop: builds the Rasterizer and its bench collaborators, plays a
//! scene and watches for stalls.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use image::{ImageFormat, Rgba, RgbaImage};
use rsim_core::{PipelineStage, RasterizerConfig, RasterizerState, SimError, Statistics};
use rsim_emulator::{EdgeEmulator, SharedEmulator};

use crate::bench::{BenchConfig, ColorWriteSink, CommandProcessor, ShaderUnit, Streamer};
use crate::rasterizer::Rasterizer;
use crate::scene::Scene;
use crate::RunError;

/// Stall detection walks every box; once per this many cycles is enough.
const STALL_CHECK_INTERVAL: u64 = 256;

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scene: String,
    pub cycles: u64,
    /// Counters per box, Rasterizer first.
    pub statistics: Vec<(String, Statistics)>,
}

impl RunSummary {
    /// Counter `name` of box `unit`.
    pub fn get(&self, unit: &str, name: &str) -> u64 {
        self.statistics
            .iter()
            .find(|(n, _)| n == unit)
            .map_or(0, |(_, s)| s.get(name))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scene '{}' finished in {} cycles", self.scene, self.cycles)?;
        for (name, stats) in &self.statistics {
            writeln!(f, "  {name}: {stats}")?;
        }
        Ok(())
    }
}

pub struct Simulator {
    rasterizer: Rasterizer,
    emu: Rc<RefCell<EdgeEmulator>>,
    cp: CommandProcessor,
    streamer: Streamer,
    shaders: Vec<ShaderUnit>,
    color_write: Vec<ColorWriteSink>,
    scene: String,
    cycle: u64,
}

impl Simulator {
    pub fn new(cfg: RasterizerConfig) -> Result<Self, RunError> {
        Self::with_bench(cfg, BenchConfig::default())
    }

    pub fn with_bench(cfg: RasterizerConfig, bench: BenchConfig) -> Result<Self, RunError> {
        let emu = Rc::new(RefCell::new(EdgeEmulator::new(cfg.width, cfg.height)));
        let shared: SharedEmulator = emu.clone();
        let rasterizer = Rasterizer::new(cfg, shared)?;
        let p = rasterizer.ports().clone();

        let cp = CommandProcessor::new(p.command.clone(), p.state.clone());
        let streamer = Streamer::new(
            p.vertex_input.clone(),
            p.vertex_state.clone(),
            p.vertex_output.clone(),
            p.setup_input.clone(),
            p.setup_request.clone(),
        );
        let shaders = (0..p.shader_input.len())
            .map(|i| {
                ShaderUnit::new(
                    format!("Shader{i}"),
                    &bench,
                    p.shader_input[i].clone(),
                    p.shader_state[i].clone(),
                    p.shader_output[i].clone(),
                )
            })
            .collect();
        let color_write = (0..p.color_write.len())
            .map(|u| ColorWriteSink::new(u, p.color_write[u].clone(), p.color_write_state[u].clone()))
            .collect();

        Ok(Self {
            rasterizer,
            emu,
            cp,
            streamer,
            shaders,
            color_write,
            scene: String::new(),
            cycle: 0,
        })
    }

    pub fn rasterizer(&self) -> &Rasterizer {
        &self.rasterizer
    }

    pub fn rasterizer_mut(&mut self) -> &mut Rasterizer {
        &mut self.rasterizer
    }

    pub fn emulator(&self) -> &Rc<RefCell<EdgeEmulator>> {
        &self.emu
    }

    pub fn color_write(&self, unit: usize) -> &ColorWriteSink {
        &self.color_write[unit]
    }

    pub fn color_write_mut(&mut self, unit: usize) -> &mut ColorWriteSink {
        &mut self.color_write[unit]
    }

    pub fn shader(&self, index: usize) -> &ShaderUnit {
        &self.shaders[index]
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Queue `scene` behind whatever is still pending.
    pub fn load(&mut self, scene: &Scene) -> Result<(), RunError> {
        scene.validate()?;
        log::info!("loading scene '{}' ({} ops, {} draws)", scene.name, scene.ops.len(), scene.draws());
        self.cp.load(scene);
        self.scene = scene.name.clone();
        Ok(())
    }

    /// One cycle of every box, producers before consumers.
    pub fn step(&mut self) {
        let c = self.cycle;
        self.cp.clock(c, &mut self.streamer);
        self.streamer.clock(c);
        self.rasterizer.clock(c);
        for s in &mut self.shaders {
            s.clock(c);
        }
        for cw in &mut self.color_write {
            cw.clock(c);
        }
        self.cycle += 1;
    }

    fn finished(&self) -> bool {
        self.cp.is_done() && self.rasterizer.state() == RasterizerState::Ready
    }

    /// Run until the loaded scene is done, for at most `max_cycles` more
    /// cycles.
    pub fn run(&mut self, max_cycles: u64) -> Result<RunSummary, RunError> {
        let start = self.cycle;
        let threshold = self.rasterizer.config().stall_threshold;
        while !self.finished() {
            if self.cycle - start >= max_cycles {
                return Err(RunError::CycleLimit(max_cycles));
            }
            self.step();
            if self.cycle % STALL_CHECK_INTERVAL == 0 && self.rasterizer.detect_stall(self.cycle, threshold).stalled {
                let report = self.rasterizer.stall_report(self.cycle);
                log::warn!("stall detected at cycle {}", self.cycle);
                return Err(RunError::Stalled {
                    cycle: self.cycle,
                    report,
                });
            }
        }
        log::info!("scene '{}' done at cycle {}", self.scene, self.cycle);
        Ok(self.summary(self.cycle - start))
    }

    pub fn summary(&self, cycles: u64) -> RunSummary {
        let mut statistics: Vec<(String, Statistics)> = self
            .rasterizer
            .all_statistics()
            .into_iter()
            .map(|(n, s)| (n.to_string(), s.clone()))
            .collect();
        statistics.push(("CommandProcessor".to_string(), self.cp.statistics().clone()));
        statistics.push(("Streamer".to_string(), self.streamer.statistics().clone()));
        for s in &self.shaders {
            statistics.push((s.name().to_string(), s.statistics().clone()));
        }
        for cw in &self.color_write {
            statistics.push((format!("ColorWrite{}", cw.unit()), cw.statistics().clone()));
        }
        RunSummary {
            scene: self.scene.clone(),
            cycles,
            statistics,
        }
    }

    /// Colors written so far, merged from every color write unit.
    pub fn color_image(&self) -> RgbaImage {
        let cfg = self.rasterizer.config();
        let mut img = RgbaImage::new(cfg.width, cfg.height);
        for cw in &self.color_write {
            for (&(x, y), c) in cw.colors() {
                if x >= 0 && y >= 0 && (x as u32) < cfg.width && (y as u32) < cfg.height {
                    let px = c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8);
                    img.put_pixel(x as u32, y as u32, Rgba(px));
                }
            }
        }
        img
    }

    pub fn write_color_png(&self, path: impl AsRef<std::path::Path>) -> Result<(), RunError> {
        self.color_image()
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| RunError::Sim(SimError::Io(std::io::Error::other(e))))
    }
}
