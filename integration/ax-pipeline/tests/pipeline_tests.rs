//! End-to-end pipeline scenarios.

use ax_model_core::types::{TriangleSetupInput, VertexAttributes};
use ax_pipeline::{Pipeline, PipelineConfig};
use ax_raster::{RasterizerConfig, ScanMode};
use ax_streamer::loader::VertexJob;
use glam::Vec4;

fn vert(x: f32, y: f32, z: f32, w: f32) -> VertexAttributes {
    vec![Vec4::new(x, y, z, w), Vec4::new(1.0, 0.0, 0.0, 1.0)]
}

fn small_viewport_config(side: u32, d3d9: bool) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.raster = RasterizerConfig {
        viewport_w: side,
        viewport_h: side,
        window_w: side,
        window_h: side,
        active_triangles: 8,
        scan_tile_w: 8,
        scan_tile_h: 8,
        gen_tile_w: 4,
        gen_tile_h: 4,
        d3d9_depth_range: d3d9,
        d3d9_rasterization_rules: d3d9,
        ..RasterizerConfig::default()
    };
    cfg
}

mod clipping {
    use super::*;

    #[test]
    fn fully_outside_triangle_is_dropped() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-2.0, 0.0, 0.0, 1.0),
            vert(-3.0, 0.0, 0.0, 1.0),
            vert(-2.5, 1.0, 0.0, 1.0),
        ));
        p.run_until_idle(2000);

        assert_eq!(p.clipper().stats().get("clipped"), 1);
        assert!(p.shaded_fragments.is_empty());
    }
}

mod single_pixel {
    use super::*;

    #[test]
    fn one_pixel_triangle_shades_one_covered_fragment() {
        // Screen triangle (10,10)-(11,10)-(10,11) under D3D9 rules on a
        // 16x16 viewport; depth 0 maps to converted depth 0.
        let mut p = Pipeline::new(small_viewport_config(16, true));
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(0.25, 0.25, 0.0, 1.0),
            vert(0.375, 0.25, 0.0, 1.0),
            vert(0.25, 0.375, 0.0, 1.0),
        ));
        p.run_until_idle(4000);

        let inside: Vec<_> = p.shaded_fragments.iter().filter(|f| f.inside).collect();
        assert_eq!(inside.len(), 1, "exactly one covered fragment");
        assert_eq!((inside[0].x, inside[0].y), (10, 10));
        assert_eq!(inside[0].zc, 0);
    }
}

mod stamp_quad {
    use super::*;

    #[test]
    fn corner_triangle_covers_three_of_four() {
        // Screen triangle (0,0)-(2,0)-(0,2) on a 4x4 viewport.
        let mut cfg = small_viewport_config(4, true);
        cfg.raster.scan_tile_w = 4;
        cfg.raster.scan_tile_h = 4;
        cfg.raster.gen_tile_w = 2;
        cfg.raster.gen_tile_h = 2;
        let mut p = Pipeline::new(cfg);
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-1.0, -1.0, 0.5, 1.0),
            vert(0.0, -1.0, 0.5, 1.0),
            vert(-1.0, 0.0, 0.5, 1.0),
        ));
        p.run_until_idle(4000);

        let stamp: Vec<_> = p
            .shaded_fragments
            .iter()
            .filter(|f| (0..2).contains(&f.x) && (0..2).contains(&f.y))
            .collect();
        assert_eq!(stamp.len(), 4, "the whole stamp shades");
        let covered = stamp.iter().filter(|f| f.inside).count();
        assert_eq!(covered, 3, "three of four pixels inside");
        let outside = stamp.iter().find(|f| !f.inside).unwrap();
        assert_eq!((outside.x, outside.y), (1, 1));
    }
}

mod ordering {
    use super::*;

    #[test]
    fn fragments_of_earlier_triangles_shade_first() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        // Two disjoint triangles; triangle order must survive the core.
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-1.0, -1.0, 0.0, 1.0),
            vert(-0.5, -1.0, 0.0, 1.0),
            vert(-1.0, -0.5, 0.0, 1.0),
        ));
        p.feed_triangle(TriangleSetupInput::new(
            1,
            vert(0.0, 0.0, 0.0, 1.0),
            vert(0.5, 0.0, 0.0, 1.0),
            vert(0.0, 0.5, 0.0, 1.0),
        ));
        p.run_until_idle(6000);

        let triangles: Vec<u32> = p
            .shaded_fragments
            .iter()
            .filter(|f| f.inside)
            .map(|f| f.triangle)
            .collect();
        assert!(!triangles.is_empty());
        let first_of_second = triangles.iter().position(|&t| t != triangles[0]);
        if let Some(boundary) = first_of_second {
            assert!(
                triangles[boundary..].iter().all(|&t| t == triangles[boundary]),
                "triangle fragments must not interleave"
            );
        }
    }

    #[test]
    fn scanline_mode_drives_the_same_pipeline() {
        let mut cfg = small_viewport_config(16, false);
        cfg.scan_mode = ScanMode::Scanline;
        let mut p = Pipeline::new(cfg);
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-1.0, -1.0, 0.0, 1.0),
            vert(1.0, -1.0, 0.0, 1.0),
            vert(-1.0, 1.0, 0.0, 1.0),
        ));
        p.run_until_idle(8000);
        let covered = p.shaded_fragments.iter().filter(|f| f.inside).count();
        assert_eq!(covered, 120);
    }
}

mod interpolation {
    use super::*;

    #[test]
    fn flat_color_passes_through_shading() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-1.0, -1.0, 0.0, 1.0),
            vert(1.0, -1.0, 0.0, 1.0),
            vert(-1.0, 1.0, 0.0, 1.0),
        ));
        p.run_until_idle(8000);

        for f in p.shaded_fragments.iter().filter(|f| f.inside) {
            // Attribute 1 is constant red; the passthrough program copies
            // the interpolated value to output 1.
            let c = f.outputs[1];
            assert!((c.x - 1.0).abs() < 1e-4 && c.y.abs() < 1e-4, "color {c}");
        }
    }
}

mod vertex_path {
    use super::*;

    fn seed_vertices(p: &mut Pipeline, count: u32) {
        let stride = p.config().stream.stride;
        let attributes = p.config().stream.attributes;
        for i in 0..count {
            let mut bytes = Vec::new();
            for a in 0..attributes {
                for c in 0..4 {
                    let v = (i * 100 + a as u32 * 10 + c) as f32;
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
            }
            let base = i * stride;
            p.memory_mut().preload(base, &bytes);
        }
    }

    #[test]
    fn vertices_load_shade_and_return() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        seed_vertices(&mut p, 4);
        for i in 0..4 {
            p.feed_vertex_job(VertexJob {
                index: i,
                instance: 0,
                last_in_batch: i == 3,
            });
        }
        p.run_until_idle(4000);

        assert_eq!(p.shaded_vertices.len(), 4);
        // Passthrough vertex shader: output 0 equals attribute 0.
        assert_eq!(p.shaded_vertices[0].outputs[0].x, 0.0);
        assert_eq!(p.shaded_vertices[1].outputs[0].x, 100.0);
    }

    #[test]
    fn reused_index_hits_the_output_cache() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        seed_vertices(&mut p, 2);
        for i in [0u32, 1, 0, 1] {
            p.feed_vertex_job(VertexJob {
                index: i,
                instance: 0,
                last_in_batch: false,
            });
        }
        // Close the partial wavefront so lock-step can issue it.
        p.feed_vertex_job(VertexJob {
            index: 1,
            instance: 0,
            last_in_batch: true,
        });
        p.run_until_idle(6000);

        assert!(p.output_cache().stats().get("hits") >= 2, "repeats must hit");
        assert_eq!(p.shaded_vertices.len(), 5);
    }

    #[test]
    fn vertex_latency_is_recorded() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        seed_vertices(&mut p, 1);
        p.feed_vertex_job(VertexJob {
            index: 0,
            instance: 0,
            last_in_batch: true,
        });
        p.run_until_idle(4000);
        assert_eq!(p.shaded_vertices.len(), 1);
        assert!(p.shaded_vertices[0].input.shader_latency > 0);
    }
}

mod msaa {
    use ax_raster::msaa::{pattern, MSAA_SUBPIXEL_PRECISION};
    use ax_raster::{RasterizerConfig, RasterizerCore};
    use ax_model_core::types::VertexAttributes;
    use glam::Vec4;

    fn vert(x: f32, y: f32, z: f32) -> VertexAttributes {
        vec![Vec4::new(x, y, z, 1.0)]
    }

    fn msaa_core() -> RasterizerCore {
        RasterizerCore::new(RasterizerConfig {
            viewport_w: 4,
            viewport_h: 4,
            window_w: 4,
            window_h: 4,
            active_triangles: 4,
            scan_tile_w: 4,
            scan_tile_h: 4,
            gen_tile_w: 2,
            gen_tile_h: 2,
            msaa_samples: 4,
            ..RasterizerConfig::default()
        })
    }

    #[test]
    fn centroid_is_the_mean_of_covered_samples() {
        let mut core = msaa_core();
        let id = core.setup(
            vert(-1.0, -1.0, 0.2),
            vert(0.0, -1.0, 0.2),
            vert(-1.0, 0.0, 0.2),
        );
        core.start_recursive(&[id], true);

        let mut partially_covered = 0;
        while let Some((mut stamp, _)) = core.next_stamp_recursive_blocking() {
            for f in &mut stamp.fragments {
                core.compute_msaa_samples(f, 4);
                let Some(msaa) = &f.msaa else { continue };
                if !msaa.any_inside || msaa.coverage.iter().all(|&c| c) {
                    continue;
                }
                partially_covered += 1;

                // Recompute the mean of the covered sample values.
                let t = core.triangle(id);
                let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
                let mut mean = [0.0f64; 4];
                let mut n = 0.0;
                for (i, &(ox, oy)) in pattern(4).iter().enumerate() {
                    if !msaa.coverage[i] {
                        continue;
                    }
                    let dx = ox / MSAA_SUBPIXEL_PRECISION;
                    let dy = oy / MSAA_SUBPIXEL_PRECISION;
                    mean[0] += f.coords[0] + e1[0] * dx + e1[1] * dy;
                    mean[1] += f.coords[1] + e2[0] * dx + e2[1] * dy;
                    mean[2] += f.coords[2] + e3[0] * dx + e3[1] * dy;
                    mean[3] += f.coords[3] + z[0] * dx + z[1] * dy;
                    n += 1.0;
                }
                for (c, m) in msaa.centroid.iter().zip(mean.iter()) {
                    assert!((c - m / n).abs() < 1e-9, "centroid diverges");
                }
            }
            if stamp.is_last() {
                break;
            }
        }
        assert!(partially_covered > 0, "the diagonal must partially cover");
    }

    #[test]
    fn per_sample_depth_matches_the_equation() {
        let mut core = msaa_core();
        let id = core.setup(
            vert(-1.0, -1.0, 0.1),
            vert(0.0, -1.0, 0.5),
            vert(-1.0, 0.0, 0.9),
        );
        core.start_recursive(&[id], true);

        while let Some((mut stamp, _)) = core.next_stamp_recursive_blocking() {
            for f in &mut stamp.fragments {
                core.compute_msaa_samples(f, 4);
                let msaa = f.msaa.as_ref().unwrap();
                let t = core.triangle(id);
                let z = t.zeq();
                for (i, &(ox, oy)) in pattern(4).iter().enumerate() {
                    let dx = ox / MSAA_SUBPIXEL_PRECISION;
                    let dy = oy / MSAA_SUBPIXEL_PRECISION;
                    let zw = f.coords[3] + z[0] * dx + z[1] * dy;
                    assert_eq!(msaa.z[i], core.convert_z(zw));
                }
            }
            if stamp.is_last() {
                break;
            }
        }
    }
}

mod invariants {
    use super::*;

    #[test]
    fn setup_slots_all_return_after_a_batch() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        for i in 0..4 {
            let off = i as f32 * 0.1;
            p.feed_triangle(TriangleSetupInput::new(
                i,
                vert(-0.9 + off, -0.9, 0.0, 1.0),
                vert(-0.4 + off, -0.9, 0.0, 1.0),
                vert(-0.9 + off, -0.4, 0.0, 1.0),
            ));
        }
        p.run_until_idle(8000);
        assert_eq!(p.rasterizer().core().free_setup_slots(), 8);
    }

    #[test]
    fn degenerate_triangle_emits_no_covered_fragments() {
        let mut p = Pipeline::new(small_viewport_config(16, false));
        p.feed_triangle(TriangleSetupInput::new(
            0,
            vert(-0.5, -0.5, 0.0, 1.0),
            vert(0.5, 0.5, 0.0, 1.0),
            vert(0.0, 0.0, 0.0, 1.0),
        ));
        p.run_until_idle(4000);
        assert_eq!(
            p.shaded_fragments.iter().filter(|f| f.inside).count(),
            0,
            "zero-area triangles cover nothing"
        );
    }
}
