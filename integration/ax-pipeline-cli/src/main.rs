//! Command-line front end for the axion GPU model.
//!
//! Runs a built-in demo triangle batch through the full pipeline with the
//! given hardware configuration, prints the per-unit statistics, and
//! optionally writes the resulting coverage as a PNG.

use anyhow::{Context, Result};
use ax_model_core::types::{FaceMode, TriangleSetupInput, VertexAttributes};
use ax_pipeline::{Pipeline, PipelineConfig};
use ax_raster::{RasterizerConfig, ScanMode};
use ax_shader::ShaderConfig;
use clap::Parser;
use glam::Vec4;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "ax-pipeline", about = "Cycle-level axion GPU core model")]
struct Args {
    /// Viewport (and window) side length in pixels.
    #[arg(long, default_value_t = 64)]
    viewport: u32,

    /// Scan tile width and height in pixels.
    #[arg(long, default_value_t = 8)]
    scan_tile: u32,

    /// Over tile width and height in scan tiles.
    #[arg(long, default_value_t = 4)]
    over_tile: u32,

    /// Generation tile width and height in pixels.
    #[arg(long, default_value_t = 4)]
    gen_tile: u32,

    /// Entries in the setup triangle table.
    #[arg(long, default_value_t = 16)]
    max_triangles: usize,

    /// Subpixel precision bits.
    #[arg(long, default_value_t = 8)]
    subpixel_bits: u32,

    /// MSAA samples (1, 2, 4, 6 or 8).
    #[arg(long, default_value_t = 1)]
    msaa: u32,

    /// Depth buffer precision in bits.
    #[arg(long, default_value_t = 24)]
    depth_bits: u32,

    /// Use the D3D9 pixel coordinate convention.
    #[arg(long)]
    d3d9_pixel_coords: bool,

    /// Use the D3D9 [0,1] depth range.
    #[arg(long)]
    d3d9_depth_range: bool,

    /// Use the D3D9 rasterization rules (no half-pixel sample offset).
    #[arg(long)]
    d3d9_rules: bool,

    /// Front face winding (cw or ccw).
    #[arg(long, default_value = "ccw")]
    front_face: String,

    /// Use the tiled scanline engine instead of the recursive one.
    #[arg(long)]
    scanline: bool,

    /// Shader thread count.
    #[arg(long, default_value_t = 64)]
    threads: usize,

    /// Shader input buffers.
    #[arg(long, default_value_t = 32)]
    input_buffers: usize,

    /// Shader per-thread resource units.
    #[arg(long, default_value_t = 2048)]
    resources: u32,

    /// Wavefront width.
    #[arg(long, default_value_t = 4)]
    wavefront: u32,

    /// Disable lock-step wavefront execution.
    #[arg(long)]
    no_lock_step: bool,

    /// Enable SIMD + scalar co-issue.
    #[arg(long)]
    scalar_coissue: bool,

    /// Enable the thread-window scheduler.
    #[arg(long)]
    thread_window: bool,

    /// Thread window size.
    #[arg(long, default_value_t = 16)]
    window_size: u32,

    /// Cycles before a thread can be fetched again.
    #[arg(long, default_value_t = 0)]
    fetch_delay: u32,

    /// Swap the active thread only on blocks.
    #[arg(long)]
    swap_on_block: bool,

    /// Texture units attached to the shader.
    #[arg(long, default_value_t = 1)]
    texture_units: u32,

    /// Decode on every fetch instead of caching decoded instructions.
    #[arg(long)]
    no_decoded_cache: bool,

    /// Cycle budget for the run.
    #[arg(long, default_value_t = 100_000)]
    max_cycles: u64,

    /// Demo triangles around a circle.
    #[arg(long, default_value_t = 8)]
    demo_triangles: u32,

    /// Write the coverage image to this PNG path.
    #[arg(long)]
    coverage: Option<String>,

    /// Dump per-unit statistics after the run.
    #[arg(long)]
    stats: bool,
}

fn build_config(args: &Args) -> PipelineConfig {
    let face_mode = match args.front_face.as_str() {
        "cw" => FaceMode::Cw,
        _ => FaceMode::Ccw,
    };
    let mut cfg = PipelineConfig::default();
    cfg.raster = RasterizerConfig {
        viewport_w: args.viewport,
        viewport_h: args.viewport,
        window_w: args.viewport,
        window_h: args.viewport,
        scissor_w: args.viewport,
        scissor_h: args.viewport,
        scan_tile_w: args.scan_tile,
        scan_tile_h: args.scan_tile,
        over_tile_w: args.over_tile,
        over_tile_h: args.over_tile,
        gen_tile_w: args.gen_tile,
        gen_tile_h: args.gen_tile,
        active_triangles: args.max_triangles,
        subpixel_bits: args.subpixel_bits,
        msaa_samples: args.msaa,
        depth_bits: args.depth_bits,
        d3d9_pixel_coordinates: args.d3d9_pixel_coords,
        d3d9_depth_range: args.d3d9_depth_range,
        d3d9_rasterization_rules: args.d3d9_rules,
        face_mode,
        ..RasterizerConfig::default()
    };
    cfg.scan_mode = if args.scanline {
        ScanMode::Scanline
    } else {
        ScanMode::Recursive
    };
    cfg.shader = ShaderConfig {
        num_threads: args.threads,
        num_input_buffers: args.input_buffers,
        num_resources: args.resources,
        wavefront_size: args.wavefront,
        lock_step: !args.no_lock_step && !args.thread_window && !args.swap_on_block,
        scalar_alu: args.scalar_coissue,
        thread_window: args.thread_window,
        window_size: args.window_size,
        fetch_delay: args.fetch_delay,
        swap_on_block: args.swap_on_block,
        texture_units: args.texture_units,
        store_decoded: !args.no_decoded_cache,
        ..ShaderConfig::default()
    };
    cfg
}

fn demo_vertex(x: f32, y: f32, color: Vec4) -> VertexAttributes {
    vec![Vec4::new(x, y, 0.0, 1.0), color]
}

/// A fan of triangles around the viewport center.
fn demo_batch(count: u32) -> Vec<TriangleSetupInput> {
    let mut batch = Vec::new();
    for i in 0..count {
        let a0 = (i as f32) / (count as f32) * std::f32::consts::TAU;
        let a1 = ((i + 1) as f32) / (count as f32) * std::f32::consts::TAU;
        let color = Vec4::new(
            0.5 + 0.5 * a0.cos(),
            0.5 + 0.5 * a0.sin(),
            1.0 - (i as f32) / (count as f32),
            1.0,
        );
        batch.push(TriangleSetupInput::new(
            i,
            demo_vertex(0.0, 0.0, color),
            demo_vertex(0.8 * a0.cos(), 0.8 * a0.sin(), color),
            demo_vertex(0.8 * a1.cos(), 0.8 * a1.sin(), color),
        ));
    }
    batch
}

fn write_coverage(path: &str, pipeline: &Pipeline) -> Result<()> {
    let side = pipeline.config().raster.viewport_w;
    let mut img = image::RgbImage::new(side, side);
    for f in pipeline
        .shaded_fragments
        .iter()
        .filter(|f| f.inside && !f.kill)
    {
        if f.x < 0 || f.y < 0 || f.x as u32 >= side || f.y as u32 >= side {
            continue;
        }
        let c = f.outputs.get(1).copied().unwrap_or(Vec4::ONE);
        // Screen y grows upwards; image rows grow downwards.
        let py = side - 1 - f.y as u32;
        img.put_pixel(
            f.x as u32,
            py,
            image::Rgb([
                (c.x.clamp(0.0, 1.0) * 255.0) as u8,
                (c.y.clamp(0.0, 1.0) * 255.0) as u8,
                (c.z.clamp(0.0, 1.0) * 255.0) as u8,
            ]),
        );
    }
    img.save(path).with_context(|| format!("writing {path}"))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = build_config(&args);
    let mut pipeline = Pipeline::new(cfg);

    for triangle in demo_batch(args.demo_triangles) {
        pipeline.feed_triangle(triangle);
    }

    let cycles = pipeline.run_until_idle(args.max_cycles);
    let covered = pipeline
        .shaded_fragments
        .iter()
        .filter(|f| f.inside)
        .count();

    info!("run finished after {cycles} cycles");
    println!(
        "{} cycles, {} fragments shaded ({} covered), {} vertices shaded",
        cycles,
        pipeline.shaded_fragments.len(),
        covered,
        pipeline.shaded_vertices.len()
    );

    if args.stats {
        print!("{}", pipeline.dump_stats());
    }

    if let Some(path) = &args.coverage {
        write_coverage(path, &pipeline)?;
        println!("coverage written to {path}");
    }

    Ok(())
}
