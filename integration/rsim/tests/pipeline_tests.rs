//! End-to-end scenarios: scenes played through the whole rasterizer with
//! the bench collaborators attached.
//!
//! Each test builds a small screen so runs stay short, drives a scene to
//! completion and then checks counters, colors or depth contents.

use rsim::{DrawCall, RunError, RunSummary, Scene, Simulator};
use rsim_core::primitive::Vertex;
use rsim_core::stamp::COLOR_ATTRIBUTE;
use rsim_core::{CompareFunction, PipelineStage, RasterizerCommand, RasterizerConfig, RasterizerState};

const SIZE: u32 = 64;
const MAX_CYCLES: u64 = 200_000;

fn config(units: usize) -> RasterizerConfig {
    RasterizerConfig {
        width: SIZE,
        height: SIZE,
        num_stamp_units: units,
        ..RasterizerConfig::default()
    }
}

fn run_scene(cfg: RasterizerConfig, scene: &Scene) -> (Simulator, RunSummary) {
    let mut sim = Simulator::new(cfg).unwrap();
    sim.load(scene).unwrap();
    let summary = sim.run(MAX_CYCLES).unwrap();
    (sim, summary)
}

fn builtin(name: &str) -> Scene {
    Scene::builtin(name, SIZE, SIZE).unwrap()
}

fn color_fragments(sim: &Simulator, units: usize) -> u64 {
    (0..units).map(|u| sim.color_write(u).statistics().get("fragments")).sum()
}

mod draw_tests {
    use super::*;
    use rsim_emulator::RasterizerEmulator;

    #[test]
    fn single_stamp_reaches_every_stage() {
        let scene = Scene::new("stamp").screen(SIZE, SIZE).draw(DrawCall::new().triangle([
            Vertex::at(0.0, 0.0, 0.5),
            Vertex::at(2.0, 0.0, 0.5),
            Vertex::at(0.0, 2.0, 0.5),
        ]));
        let (sim, summary) = run_scene(config(1), &scene);
        assert_eq!(summary.get("TriangleSetup", "outputs"), 1);
        assert_eq!(summary.get("TriangleTraversal", "outputs"), 1);
        assert_eq!(summary.get("HierarchicalZ", "outputs"), 1);
        assert_eq!(summary.get("ColorWrite0", "stamps"), 1);
        assert_eq!(summary.get("ColorWrite0", "lasts"), 1);
        assert_eq!(summary.get("Rasterizer", "draws"), 1);
        assert_eq!(sim.rasterizer().state(), RasterizerState::Ready);
        assert_eq!(sim.emulator().borrow().live_triangles(), 0);
    }

    #[test]
    fn colors_are_interpolated_across_the_triangle() {
        let (sim, summary) = run_scene(config(2), &builtin("triangle"));
        let fragments = color_fragments(&sim, 2);
        assert!(fragments > 100, "only {fragments} fragments written");
        for u in 0..2 {
            for c in sim.color_write(u).colors().values() {
                let sum = c[0] + c[1] + c[2];
                assert!((sum - 1.0).abs() < 0.05, "color {c:?} is not a blend of the vertex colors");
            }
        }
        assert_eq!(summary.get("CommandProcessor", "draws"), 1);
    }

    #[test]
    fn back_faces_are_culled_in_setup() {
        let (sim, summary) = run_scene(config(2), &builtin("culling"));
        assert_eq!(summary.get("TriangleSetup", "culled"), 2);
        assert_eq!(summary.get("TriangleSetup", "outputs"), 2);
        assert!(color_fragments(&sim, 2) > 0);
    }

    #[test]
    fn every_unit_sees_one_last_per_draw() {
        let (sim, summary) = run_scene(config(4), &builtin("grid"));
        for u in 0..4 {
            assert_eq!(sim.color_write(u).statistics().get("lasts"), 1, "unit {u}");
        }
        assert_eq!(summary.get("TriangleSetup", "inputs"), 128);
    }

    #[test]
    fn empty_draw_completes() {
        let (sim, summary) = run_scene(config(2), &builtin("empty"));
        assert_eq!(summary.get("Rasterizer", "draws"), 1);
        assert_eq!(color_fragments(&sim, 2), 0);
        for u in 0..2 {
            assert_eq!(sim.color_write(u).statistics().get("lasts"), 1);
        }
    }

    #[test]
    fn scanline_walker_covers_the_same_pixels() {
        let (recursive, _) = run_scene(config(2), &builtin("grid"));
        let mut cfg = config(2);
        cfg.traversal.strategy = rsim_core::config::TraversalStrategy::Scanline;
        let (scanline, _) = run_scene(cfg, &builtin("grid"));
        for u in 0..2 {
            let a: Vec<_> = recursive.color_write(u).colors().keys().collect();
            let b: Vec<_> = scanline.color_write(u).colors().keys().collect();
            assert_eq!(a, b);
        }
    }
}

mod depth_tests {
    use super::*;

    #[test]
    fn hidden_triangle_never_reaches_color_write() {
        let (sim, summary) = run_scene(config(2), &builtin("overlap"));
        let mut written = 0;
        for u in 0..2 {
            for c in sim.color_write(u).colors().values() {
                assert!(c[0] > 0.99 && c[1] < 0.01, "far triangle visible: {c:?}");
                written += 1;
            }
        }
        assert!(written > 0);
        assert_eq!(summary.get("Rasterizer", "draws"), 2);
        let depth = sim.rasterizer().depth_stencil_at(4, 4).unwrap() & 0x00ff_ffff;
        assert!((0x30_0000..0x40_0000).contains(&depth), "depth {depth:#x}");
    }

    #[test]
    fn stencil_masks_the_second_draw() {
        let (sim, _) = run_scene(config(2), &builtin("stencil"));
        let at = |x: i32, y: i32| {
            let u = sim.rasterizer().config().pixel_mapper().map_to_unit(x, y);
            sim.color_write(u).colors().get(&(x, y)).copied()
        };
        // Inside the mask the blue triangle wins; outside it nothing passes.
        assert!(at(2, 2).is_some_and(|c| c[2] > 0.99));
        assert_eq!(at(40, 10), None);
        assert_eq!(sim.rasterizer().depth_stencil_at(2, 2).map(|w| w >> 24), Some(1));
    }

    #[test]
    fn depth_image_merges_units() {
        let (sim, _) = run_scene(config(4), &builtin("overlap"));
        let img = sim.rasterizer().depth_image(false);
        assert_eq!(img.dimensions(), (SIZE, SIZE));
        // Covered pixels hold the near depth, the far corner keeps the clear.
        assert_eq!(img.get_pixel(2, 2).0[0], 0x33);
        assert_eq!(img.get_pixel(SIZE - 1, SIZE - 1).0[0], 0xff);
    }
}

mod backpressure_tests {
    use super::*;

    #[test]
    fn small_queues_and_busy_color_write_lose_nothing() {
        let (reference, _) = run_scene(config(2), &builtin("grid"));

        let mut cfg = config(2);
        cfg.fragment_fifo.rast_queue_size = 8;
        cfg.fragment_fifo.test_queue_size = 4;
        cfg.fragment_fifo.int_queue_size = 4;
        cfg.fragment_fifo.shaded_queue_size = 4;
        let mut sim = Simulator::new(cfg).unwrap();
        sim.color_write_mut(0).set_busy_until(2_000);
        sim.load(&builtin("grid")).unwrap();
        sim.run(MAX_CYCLES).unwrap();

        assert_eq!(color_fragments(&sim, 2), color_fragments(&reference, 2));
        for u in 0..2 {
            assert_eq!(sim.color_write(u).colors(), reference.color_write(u).colors());
        }
        assert!(sim.cycle() > 2_000);
    }

    #[test]
    fn single_line_hz_cache_still_finishes() {
        let mut cfg = config(2);
        cfg.hz.cache_lines = 1;
        let (sim, summary) = run_scene(cfg, &builtin("grid"));
        let (reference, _) = run_scene(config(2), &builtin("grid"));
        assert_eq!(color_fragments(&sim, 2), color_fragments(&reference, 2));
        assert!(summary.get("HierarchicalZ", "misses") > 0);
    }

    #[test]
    fn blocked_color_write_is_reported_as_a_stall() {
        let mut cfg = config(1);
        cfg.stall_threshold = 300;
        let mut sim = Simulator::new(cfg).unwrap();
        sim.color_write_mut(0).set_busy_until(u64::MAX);
        sim.load(&builtin("triangle")).unwrap();
        match sim.run(MAX_CYCLES) {
            Err(RunError::Stalled { report, .. }) => assert!(report.contains("FragmentFIFO")),
            other => panic!("expected a stall, got {other:?}"),
        }
    }

    #[test]
    fn cycle_limit_is_an_error() {
        let mut sim = Simulator::new(config(1)).unwrap();
        sim.load(&builtin("grid")).unwrap();
        assert!(matches!(sim.run(50), Err(RunError::CycleLimit(50))));
    }
}

mod state_tests {
    use super::*;

    #[test]
    fn saved_state_is_restored_by_a_fresh_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2);
        cfg.state_dir = Some(dir.path().to_path_buf());

        let (mut first, _) = run_scene(cfg.clone(), &builtin("triangle"));
        // Let the HZ refreshes from the final flush land before saving.
        for _ in 0..200 {
            first.step();
        }
        first.load(&Scene::new("save").command(RasterizerCommand::SaveState)).unwrap();
        first.run(MAX_CYCLES).unwrap();
        assert!(dir.path().join("zst_block_state_0.bin").exists());

        let restore = Scene::new("restore").command(RasterizerCommand::RestoreState);
        let (second, _) = run_scene(cfg.clone(), &restore);

        let blocks = cfg.layout().block_count() as u32;
        let hz = |s: &Simulator| (0..blocks).map(|b| s.rasterizer().hierarchical_z().block_value(b)).collect::<Vec<_>>();
        assert_eq!(hz(&first), hz(&second));
        assert!(hz(&second).iter().any(|&z| z < 0x00ff_ffff));
        for u in 0..2 {
            assert_eq!(
                first.rasterizer().zstencil(u).memory().states(),
                second.rasterizer().zstencil(u).memory().states()
            );
        }
    }

    #[test]
    fn depth_dump_writes_one_png_per_unit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2);
        cfg.dump_dir = Some(dir.path().to_path_buf());
        run_scene(cfg, &builtin("triangle").command(RasterizerCommand::DumpDepth));
        for u in 0..2 {
            assert!(dir.path().join(format!("depth_unit{u}_0000.png")).exists());
        }
    }

    #[test]
    fn hz_buffer_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hz.bin");
        let (sim, _) = run_scene(config(2), &builtin("overlap"));
        sim.rasterizer().save_hz_buffer(&path).unwrap();

        let (mut other, _) = run_scene(config(2), &Scene::new("idle"));
        other.rasterizer_mut().load_hz_buffer(&path).unwrap();
        assert_eq!(
            sim.rasterizer().hierarchical_z().hz_buffer(),
            other.rasterizer().hierarchical_z().hz_buffer()
        );
    }

    #[test]
    fn depth_test_function_is_respected_across_draws() {
        // GREATER after a clear to zero depth: the far triangle wins.
        let scene = Scene::new("greater")
            .screen(SIZE, SIZE)
            .write(rsim_core::GpuRegister::ZBufferClear, 0, rsim_core::GpuRegData::Uint(0))
            .command(RasterizerCommand::ClearZStencil)
            .depth_test(CompareFunction::Greater)
            .draw(DrawCall::new().triangle([
                Vertex::at(0.0, 0.0, 0.8).with_attribute(COLOR_ATTRIBUTE, [0.0, 1.0, 0.0, 1.0]),
                Vertex::at(SIZE as f32, 0.0, 0.8).with_attribute(COLOR_ATTRIBUTE, [0.0, 1.0, 0.0, 1.0]),
                Vertex::at(0.0, SIZE as f32, 0.8).with_attribute(COLOR_ATTRIBUTE, [0.0, 1.0, 0.0, 1.0]),
            ]))
            .draw(DrawCall::new().triangle([
                Vertex::at(0.0, 0.0, 0.2).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
                Vertex::at(SIZE as f32, 0.0, 0.2).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
                Vertex::at(0.0, SIZE as f32, 0.2).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
            ]));
        let (sim, _) = run_scene(config(2), &scene);
        for u in 0..2 {
            assert!(sim.color_write(u).colors().values().all(|c| c[1] > 0.99));
        }
    }
}
