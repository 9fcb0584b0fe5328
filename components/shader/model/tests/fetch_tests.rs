//! Front-end tests: thread scheduling, lock-step invariants and stalls.

use ax_model_core::ClockedUnit;
use ax_shader::emu::PARTITION_INSTRUCTIONS;
use ax_shader::fetch::{ShaderConfig, ShaderFetch};
use ax_shader::input::ShaderInput;
use ax_shader::isa::{Bank, Opcode, Operand, ShaderInstr};
use glam::Vec4;

/// A trivial vertex program: out0 = in0 + in0, then END.
fn double_program() -> Vec<ShaderInstr> {
    vec![
        ShaderInstr::new(Opcode::Add)
            .src(0, Operand::reg(Bank::In, 0))
            .src(1, Operand::reg(Bank::In, 0))
            .dst(Bank::Out, 0),
        ShaderInstr::new(Opcode::End),
    ]
}

fn vertex(index: u32, value: f32) -> ShaderInput {
    ShaderInput::vertex(0, index, vec![Vec4::splat(value)])
}

fn run(fetch: &mut ShaderFetch, cycles: u64) -> Vec<ax_shader::input::ShaderOutput> {
    let mut outputs = Vec::new();
    for cycle in 0..cycles {
        fetch.clock(cycle);
        while let Some(out) = fetch.output_out.read(cycle) {
            outputs.push(out);
        }
    }
    outputs
}

mod lock_step {
    use super::*;

    #[test]
    fn full_wavefront_shades_and_drains() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: true,
            wavefront_size: 4,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&double_program(), 0);
        fetch.output_request_in.write(0, 16);
        for i in 0..4 {
            fetch.input_in.write(0, vertex(i, i as f32));
        }

        let outputs = run(&mut fetch, 50);
        assert_eq!(outputs.len(), 4);
        for (i, out) in outputs.iter().enumerate() {
            assert_eq!(out.outputs[0], Vec4::splat(2.0 * i as f32));
        }
        assert!(fetch.is_idle());
    }

    #[test]
    fn partial_wavefront_needs_the_last_mark() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: true,
            wavefront_size: 4,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&double_program(), 0);
        fetch.output_request_in.write(0, 16);
        fetch.input_in.write(0, vertex(0, 1.0));
        fetch.input_in.write(0, vertex(1, 2.0).last_in_batch());

        let outputs = run(&mut fetch, 50);
        assert_eq!(outputs.len(), 2, "last mark closes the half wavefront");
    }

    #[test]
    fn shader_latency_covers_load_to_commit() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 4,
            num_input_buffers: 4,
            lock_step: true,
            wavefront_size: 4,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&double_program(), 0);
        fetch.output_request_in.write(0, 8);
        for i in 0..4 {
            fetch.input_in.write(0, vertex(i, 0.0));
        }
        let outputs = run(&mut fetch, 50);
        for out in &outputs {
            assert!(out.input.shader_latency >= 1, "some cycles must elapse");
        }
    }
}

mod thread_window {
    use super::*;

    #[test]
    fn window_mode_shades_without_wavefront_gating() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: false,
            thread_window: true,
            window_size: 8,
            threads_cycle: 2,
            fetch_delay: 1,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&double_program(), 0);
        fetch.output_request_in.write(0, 16);
        // A lone vertex with no last mark still executes in window mode.
        fetch.input_in.write(0, vertex(0, 3.0));

        let outputs = run(&mut fetch, 60);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].outputs[0], Vec4::splat(6.0));
    }
}

mod swap_on_block {
    use super::*;

    #[test]
    fn current_thread_runs_to_completion() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: false,
            thread_window: false,
            swap_on_block: true,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&double_program(), 0);
        fetch.output_request_in.write(0, 16);
        fetch.input_in.write(0, vertex(0, 1.0));
        fetch.input_in.write(0, vertex(1, 2.0));

        let outputs = run(&mut fetch, 60);
        assert_eq!(outputs.len(), 2);
    }
}

mod texture_stalls {
    use super::*;

    /// out0 = tex(sampler0, in0), then END.
    fn texture_program() -> Vec<ShaderInstr> {
        vec![
            ShaderInstr::new(Opcode::Tex)
                .src(0, Operand::reg(Bank::In, 0))
                .src(1, Operand::reg(Bank::Text, 0))
                .dst(Bank::Out, 0),
            ShaderInstr::new(Opcode::End),
        ]
    }

    #[test]
    fn stamp_blocks_until_the_sample_returns() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: true,
            wavefront_size: 4,
            texture_latency: 8,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&texture_program(), 0);
        fetch.output_request_in.write(0, 16);
        for i in 0..4 {
            fetch
                .input_in
                .write(0, ShaderInput::fragment(0, i, 0, vec![Vec4::splat(i as f32)]));
        }

        let outputs = run(&mut fetch, 80);
        assert_eq!(outputs.len(), 4);
        // Identity sampler: the sample equals the coordinate.
        for out in &outputs {
            let coord = out.input.attributes[0];
            assert_eq!(out.outputs[0], coord);
        }
    }

    #[test]
    fn vertex_texture_access_is_promoted() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: false,
            thread_window: true,
            window_size: 8,
            texture_latency: 4,
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&texture_program(), 0);
        fetch.output_request_in.write(0, 16);
        fetch.input_in.write(0, vertex(0, 5.0));

        let outputs = run(&mut fetch, 80);
        assert_eq!(outputs.len(), 1, "single vertex fetch must not deadlock");
        assert_eq!(outputs[0].outputs[0], Vec4::splat(5.0));
    }
}

mod exports {
    use super::*;

    /// Kill the fragment when in0.x is negative, export depth, END.
    fn kill_and_export_program() -> Vec<ShaderInstr> {
        vec![
            ShaderInstr::new(Opcode::Kil).src(0, Operand::reg(Bank::In, 0)),
            ShaderInstr::new(Opcode::Zxp).src(0, Operand::reg(Bank::In, 1)),
            ShaderInstr::new(Opcode::End),
        ]
    }

    #[test]
    fn kill_flag_and_z_export_travel_with_the_output() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 4,
            lock_step: true,
            wavefront_size: 4,
            init_pc: [0, 0],
            ..ShaderConfig::default()
        });
        fetch.emulator_mut().load_program(&kill_and_export_program(), 0);
        fetch.output_request_in.write(0, 8);
        for i in 0..4 {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            fetch.input_in.write(
                0,
                ax_shader::input::ShaderInput::fragment(
                    0,
                    i,
                    0,
                    vec![Vec4::splat(sign), Vec4::splat(0.25 * i as f32)],
                ),
            );
        }

        let outputs = run(&mut fetch, 60);
        assert_eq!(outputs.len(), 4);
        let killed = outputs.iter().filter(|o| o.input.kill).count();
        assert_eq!(killed, 2, "odd fragments carry negative inputs");
        for out in &outputs {
            assert!(!out.z_exports.is_empty(), "z export must be recorded");
        }
    }
}

mod fragment_partition {
    use super::*;

    #[test]
    fn fragment_inputs_run_the_secondary_program() {
        let mut fetch = ShaderFetch::new(ShaderConfig {
            num_threads: 8,
            lock_step: true,
            wavefront_size: 4,
            ..ShaderConfig::default()
        });
        // Vertex partition doubles, fragment partition negates.
        fetch.emulator_mut().load_program(&double_program(), 0);
        let negate = vec![
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::In, 0).negated())
                .dst(Bank::Out, 0),
            ShaderInstr::new(Opcode::End),
        ];
        fetch
            .emulator_mut()
            .load_program(&negate, PARTITION_INSTRUCTIONS as u32);

        fetch.output_request_in.write(0, 16);
        for i in 0..4 {
            fetch
                .input_in
                .write(0, ShaderInput::fragment(0, i, 0, vec![Vec4::splat(3.0)]));
        }
        let outputs = run(&mut fetch, 60);
        assert_eq!(outputs.len(), 4);
        for out in &outputs {
            assert_eq!(out.outputs[0], Vec4::splat(-3.0));
        }
    }
}
