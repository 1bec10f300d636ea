use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rsim::{BenchConfig, Scene, Simulator};
use rsim_core::RasterizerConfig;
use rsim_hierarchical_z::{HzBuffer, DEFAULT_CLEAR_DEPTH};

#[derive(Parser)]
#[command(name = "rsim")]
#[command(about = "Cycle-level rasterizer pipeline simulator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Suppress progress output (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in scene and print per-box statistics
    Run {
        /// Pipeline configuration (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Scene to play
        #[arg(short, long, default_value = "triangle")]
        scene: String,

        /// Give up after this many cycles
        #[arg(long, default_value = "10000000")]
        max_cycles: u64,

        /// Fixed shader latency in cycles
        #[arg(long, default_value = "8")]
        shader_latency: u64,

        /// Write the merged depth buffer as a PNG
        #[arg(long)]
        dump_depth: Option<PathBuf>,

        /// Write the merged stencil buffer as a PNG
        #[arg(long)]
        dump_stencil: Option<PathBuf>,

        /// Write the colors received by color write as a PNG
        #[arg(long)]
        dump_color: Option<PathBuf>,

        /// Save the HZ buffer after the run
        #[arg(long)]
        save_hz: Option<PathBuf>,
    },
    /// Print the default configuration as JSON
    Config,
    /// List the built-in scenes
    Scenes,
    /// Summarize a saved HZ buffer
    HzInfo {
        /// HZ buffer file
        input: PathBuf,

        /// Configuration the buffer was saved with
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<RasterizerConfig> {
    match path {
        Some(p) => RasterizerConfig::from_json_file(p)
            .with_context(|| format!("loading {}", p.display())),
        None => Ok(RasterizerConfig::default()),
    }
}

struct RunArgs {
    config: Option<PathBuf>,
    scene: String,
    max_cycles: u64,
    shader_latency: u64,
    dump_depth: Option<PathBuf>,
    dump_stencil: Option<PathBuf>,
    dump_color: Option<PathBuf>,
    save_hz: Option<PathBuf>,
}

fn run(args: RunArgs, quiet: bool) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    let Some(scene) = Scene::builtin(&args.scene, cfg.width, cfg.height) else {
        bail!("unknown scene '{}' (one of: {})", args.scene, Scene::BUILTIN.join(", "));
    };
    let bench = BenchConfig {
        shader_latency: args.shader_latency,
        ..BenchConfig::default()
    };
    let mut sim = Simulator::with_bench(cfg, bench)?;
    sim.load(&scene)?;
    let summary = sim.run(args.max_cycles)?;
    if !quiet {
        print!("{summary}");
    }

    let r = sim.rasterizer();
    if let Some(path) = &args.dump_depth {
        r.write_depth_png(path, false)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &args.dump_stencil {
        r.write_depth_png(path, true)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &args.dump_color {
        sim.write_color_png(path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &args.save_hz {
        r.save_hz_buffer(path)
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("HZ buffer saved to {}", path.display());
    }
    Ok(())
}

fn hz_info(input: &Path, config: Option<&Path>) -> Result<()> {
    let cfg = load_config(config)?;
    let layout = cfg.layout();
    let mut buffer = HzBuffer::new(layout.block_count(), DEFAULT_CLEAR_DEPTH);
    buffer
        .load(input)
        .with_context(|| format!("reading {}", input.display()))?;

    let values = buffer.as_slice();
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    let cleared = values.iter().filter(|&&z| z == DEFAULT_CLEAR_DEPTH).count();
    println!(
        "{}: {} blocks of {}x{} pixels",
        input.display(),
        values.len(),
        layout.block_size,
        layout.block_size
    );
    println!("  depth range {min:#08x} .. {max:#08x}");
    println!("  {cleared} blocks at the default clear depth");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            scene,
            max_cycles,
            shader_latency,
            dump_depth,
            dump_stencil,
            dump_color,
            save_hz,
        } => run(
            RunArgs {
                config,
                scene,
                max_cycles,
                shader_latency,
                dump_depth,
                dump_stencil,
                dump_color,
                save_hz,
            },
            cli.quiet,
        ),
        Commands::Config => {
            println!("{}", RasterizerConfig::default().to_json()?);
            Ok(())
        }
        Commands::Scenes => {
            for name in Scene::BUILTIN {
                println!("{name}");
            }
            Ok(())
        }
        Commands::HzInfo { input, config } => hz_info(&input, config.as_deref()),
    }
}
