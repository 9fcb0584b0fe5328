//! Emulator tests: operand path, result path and the instruction kernels.

use ax_shader::emu::ShaderEmulator;
use ax_shader::isa::{
    Bank, Opcode, Operand, ShaderInstr, MASK_XYZW, SWIZZLE_WWWW, SWIZZLE_XXXX,
};
use glam::Vec4;

fn emulator() -> ShaderEmulator {
    ShaderEmulator::new(8, true, 4, 16)
}

fn run_one(emu: &mut ShaderEmulator, instr: ShaderInstr) {
    emu.load_program(&[instr], 0);
    emu.set_thread_pc(0, 0);
    let dec = emu.fetch(0, 0);
    emu.execute(&dec);
}

mod arithmetic {
    use super::*;

    #[test]
    fn mad_writes_the_full_vector() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.0, 2.0, 3.0, 4.0));
        emu.load_temp(0, 1, Vec4::new(5.0, 6.0, 7.0, 8.0));
        emu.load_temp(0, 2, Vec4::new(9.0, 10.0, 11.0, 12.0));

        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mad)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .src(2, Operand::reg(Bank::Temp, 2))
                .dst(Bank::Temp, 3)
                .masked(MASK_XYZW),
        );

        assert_eq!(emu.read_temp(0, 3), Vec4::new(14.0, 22.0, 32.0, 44.0));
        assert_eq!(emu.thread_pc(0), 1);
    }

    #[test]
    fn dp3_replicates_the_dot_product() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.0, 2.0, 3.0, 100.0));
        emu.load_temp(0, 1, Vec4::new(4.0, 5.0, 6.0, 100.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Dp3)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
        );
        assert_eq!(emu.read_temp(0, 2), Vec4::splat(32.0));
    }

    #[test]
    fn rcp_of_zero_is_infinite() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::ZERO);
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Rcp)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
                .dst(Bank::Temp, 1),
        );
        assert!(emu.read_temp(0, 1).x.is_infinite());
    }

    #[test]
    fn frc_drops_the_integer_part() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.25, -0.75, 3.5, 0.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Frc)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1),
        );
        let r = emu.read_temp(0, 1);
        assert!((r.x - 0.25).abs() < 1e-6);
        assert!((r.y - 0.25).abs() < 1e-6, "frc of negative wraps up: {}", r.y);
    }
}

mod kernels {
    use super::*;

    #[test]
    fn dph_takes_the_homogeneous_w() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.0, 2.0, 3.0, 99.0));
        emu.load_temp(0, 1, Vec4::new(4.0, 5.0, 6.0, 7.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Dph)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
        );
        // 1*4 + 2*5 + 3*6 + 7 = 39; operand 0's w is ignored.
        assert_eq!(emu.read_temp(0, 2), Vec4::splat(39.0));
    }

    #[test]
    fn dst_builds_the_distance_vector() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(9.0, 2.0, 3.0, 9.0));
        emu.load_temp(0, 1, Vec4::new(9.0, 4.0, 9.0, 5.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Dst)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
        );
        assert_eq!(emu.read_temp(0, 2), Vec4::new(1.0, 8.0, 3.0, 5.0));
    }

    #[test]
    fn lit_clamps_and_raises() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(0.5, 0.25, 0.0, 2.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Lit)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1),
        );
        let r = emu.read_temp(0, 1);
        assert_eq!(r.x, 1.0);
        assert_eq!(r.y, 0.5);
        assert!((r.z - 0.0625).abs() < 1e-6, "0.25^2 = {}", r.z);
        assert_eq!(r.w, 1.0);
    }

    #[test]
    fn exp_splits_into_parts() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(0.0, 0.0, 0.0, 2.5));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Exp)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_WWWW))
                .dst(Bank::Temp, 1),
        );
        let r = emu.read_temp(0, 1);
        assert_eq!(r.x, 4.0);
        assert!((r.y - 0.5).abs() < 1e-6);
        assert!((r.z - 2f32.powf(2.5)).abs() < 1e-4);
    }

    #[test]
    fn cmp_selects_per_component() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(-1.0, 1.0, -0.5, 0.0));
        emu.load_temp(0, 1, Vec4::splat(10.0));
        emu.load_temp(0, 2, Vec4::splat(20.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Cmp)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .src(2, Operand::reg(Bank::Temp, 2))
                .dst(Bank::Temp, 3),
        );
        assert_eq!(emu.read_temp(0, 3), Vec4::new(10.0, 20.0, 10.0, 20.0));
    }

    #[test]
    fn sge_and_slt_are_complementary_off_ties() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.0, 5.0, 2.0, 2.0));
        emu.load_temp(0, 1, Vec4::new(3.0, 4.0, 2.0, 1.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Sge)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
        );
        assert_eq!(emu.read_temp(0, 2), Vec4::new(0.0, 1.0, 1.0, 1.0));

        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Slt)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 3),
        );
        assert_eq!(emu.read_temp(0, 3), Vec4::new(1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn integer_predicate_compares_raw_values() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::from_array([f32::from_bits(9); 4]));
        emu.load_temp(0, 1, Vec4::from_array([f32::from_bits(4); 4]));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::StpGtI)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Pred, 1),
        );
        assert!(emu.read_pred(0, 1));
    }

    #[test]
    fn andp_combines_predicates() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(1.0));
        let program = vec![
            // p0 = (1 > 0), p1 = (1 < 0)
            ShaderInstr::new(Opcode::SetpGt)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
                .src(1, Operand::reg(Bank::Temp, 1).swizzled(SWIZZLE_XXXX))
                .dst(Bank::Pred, 0),
            ShaderInstr::new(Opcode::SetpLt)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
                .src(1, Operand::reg(Bank::Temp, 1).swizzled(SWIZZLE_XXXX))
                .dst(Bank::Pred, 1),
            ShaderInstr::new(Opcode::Andp)
                .src(0, Operand::reg(Bank::Pred, 0))
                .src(1, Operand::reg(Bank::Pred, 1))
                .dst(Bank::Pred, 2),
        ];
        emu.load_program(&program, 0);
        for pc in 0..3 {
            let dec = emu.fetch(0, pc);
            emu.execute(&dec);
        }
        assert!(emu.read_pred(0, 0));
        assert!(!emu.read_pred(0, 1));
        assert!(!emu.read_pred(0, 2));
    }

    #[test]
    fn fxmad_accumulates_through_the_fixed_point_bank() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(2.0));
        emu.load_temp(0, 1, Vec4::splat(3.0));
        let program = vec![
            // Accumulator = 2 * 3 (fixed point).
            ShaderInstr::new(Opcode::FxMul)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
            // t3 = 2 * 3 + accumulator = 12.
            ShaderInstr::new(Opcode::FxMad)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 3),
        ];
        emu.load_program(&program, 0);
        for pc in 0..2 {
            let dec = emu.fetch(0, pc);
            emu.execute(&dec);
        }
        let r = emu.read_temp(0, 3);
        assert!((r.x - 12.0).abs() < 1e-3, "fxmad result {}", r.x);
    }
}

mod operand_modifiers {
    use super::*;

    #[test]
    fn swizzle_reorders_components() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(1.0, 2.0, 3.0, 4.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_WWWW))
                .dst(Bank::Temp, 1),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(4.0));
    }

    #[test]
    fn negate_applies_after_absolute() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(-2.0, 3.0, -4.0, 5.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0).abs().negated())
                .dst(Bank::Temp, 1),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::new(-2.0, -3.0, -4.0, -5.0));
    }

    #[test]
    fn write_mask_touches_selected_components_only() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(9.0));
        emu.load_temp(0, 1, Vec4::new(1.0, 2.0, 3.0, 4.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1)
                .masked(0b1010),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::new(9.0, 2.0, 9.0, 4.0));
    }

    #[test]
    fn saturate_clamps_to_unit_range() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(-1.0, 0.5, 2.0, 1.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1)
                .saturated(),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::new(0.0, 0.5, 1.0, 1.0));
    }
}

mod predication {
    use super::*;

    #[test]
    fn false_predicate_suppresses_the_write() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(7.0));
        emu.load_temp(0, 1, Vec4::splat(1.0));
        // Predicate register 0 is false after reset.
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1)
                .predicated_by(0, false),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(1.0));
    }

    #[test]
    fn inverted_predicate_enables_the_write() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(7.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Temp, 1)
                .predicated_by(0, true),
        );
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(7.0));
    }

    #[test]
    fn setpgt_feeds_a_predicate() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(3.0, 0.0, 0.0, 0.0));
        emu.load_temp(0, 1, Vec4::new(1.0, 0.0, 0.0, 0.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::SetpGt)
                .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
                .src(1, Operand::reg(Bank::Temp, 1).swizzled(SWIZZLE_XXXX))
                .dst(Bank::Pred, 2),
        );
        assert!(emu.read_pred(0, 2));
    }
}

mod addressing {
    use super::*;

    #[test]
    fn arl_loads_the_address_register() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(3.7, -1.2, 0.0, 2.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Arl)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Addr, 0),
        );
        assert_eq!(emu.read_addr(0, 0), [3, -2, 0, 2]);
    }

    #[test]
    fn relative_param_access_resolves_at_read_time() {
        let mut emu = emulator();
        emu.load_param(5, Vec4::splat(42.0));
        emu.load_temp(0, 0, Vec4::new(3.0, 0.0, 0.0, 0.0));

        let program = vec![
            // a0.x = 3
            ShaderInstr::new(Opcode::Arl)
                .src(0, Operand::reg(Bank::Temp, 0))
                .dst(Bank::Addr, 0),
            // t1 = c[a0.x + 2] = c[5]
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::Param, 0))
                .dst(Bank::Temp, 1)
                .relative(0, 0, 2),
        ];
        emu.load_program(&program, 0);
        for pc in 0..2 {
            let dec = emu.fetch(0, pc);
            emu.execute(&dec);
        }
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(42.0));
    }

    #[test]
    fn integer_add_works_on_raw_lanes() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::from_array([f32::from_bits(5); 4]));
        emu.load_temp(0, 1, Vec4::from_array([f32::from_bits(7); 4]));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::AddI)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Temp, 1))
                .dst(Bank::Temp, 2),
        );
        assert_eq!(emu.read_temp(0, 2).x.to_bits(), 12);
    }
}

mod kill_and_export {
    use super::*;

    #[test]
    fn kil_sets_the_sample_kill_flag() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(-1.0, 0.0, 0.0, 0.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Kil).src(0, Operand::reg(Bank::Temp, 0)),
        );
        assert!(emu.thread_kill(0));
    }

    #[test]
    fn kil_with_positive_operand_does_nothing() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(1.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Kil).src(0, Operand::reg(Bank::Temp, 0)),
        );
        assert!(!emu.thread_kill(0));
    }

    #[test]
    fn chs_scopes_kls_to_the_next_sample() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(-1.0));
        let program = vec![
            ShaderInstr::new(Opcode::Chs),
            ShaderInstr::new(Opcode::Kil).src(0, Operand::reg(Bank::Temp, 0)),
        ];
        emu.load_program(&program, 0);
        for pc in 0..2 {
            let dec = emu.fetch(0, pc);
            emu.execute(&dec);
        }
        assert!(!emu.thread_kill_sample(0, 0));
        assert!(emu.thread_kill_sample(0, 1));
    }

    #[test]
    fn zxp_exports_depth() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(0.625, 0.0, 0.0, 0.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Zxp).src(0, Operand::reg(Bank::Temp, 0)),
        );
        assert_eq!(emu.thread_z_export(0, 0), 0.625);
    }

    #[test]
    fn kls_targets_an_explicit_sample() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::splat(-1.0));
        run_one(
            &mut emu,
            ShaderInstr::new(Opcode::Kls)
                .src(0, Operand::reg(Bank::Temp, 0))
                .src(1, Operand::reg(Bank::Samp, 3)),
        );
        assert!(!emu.thread_kill_sample(0, 0));
        assert!(emu.thread_kill_sample(0, 3));
    }
}

mod derivation {
    use super::*;

    #[test]
    fn quad_completes_on_the_fourth_post() {
        let mut emu = emulator();
        let values = [
            Vec4::splat(1.0),
            Vec4::splat(3.0),
            Vec4::splat(5.0),
            Vec4::splat(9.0),
        ];
        let instr = ShaderInstr::new(Opcode::Ddx)
            .src(0, Operand::reg(Bank::Temp, 0))
            .dst(Bank::Temp, 1);
        emu.load_program(&[instr], 0);

        for t in 0..4u32 {
            emu.load_temp(t, 0, values[t as usize]);
        }
        for t in 0..4u32 {
            let dec = emu.fetch(t, 0);
            let input = emu.read_operand(&dec, 0);
            let completed = emu.deriv_operation(&dec, input);
            assert_eq!(completed, t == 3);
        }

        // ddx: top row 3-1 = 2, bottom row 9-5 = 4.
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(2.0));
        assert_eq!(emu.read_temp(1, 1), Vec4::splat(2.0));
        assert_eq!(emu.read_temp(2, 1), Vec4::splat(4.0));
        assert_eq!(emu.read_temp(3, 1), Vec4::splat(4.0));
    }
}

mod jumps {
    use super::*;

    #[test]
    fn jump_moves_every_lane_of_the_wavefront() {
        let mut emu = emulator();
        // All four lanes: predicate 0 true.
        let set = ShaderInstr::new(Opcode::SetpEq)
            .src(0, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
            .src(1, Operand::reg(Bank::Temp, 0).swizzled(SWIZZLE_XXXX))
            .dst(Bank::Pred, 0);
        let jmp = ShaderInstr::new(Opcode::Jmp)
            .src(0, Operand::reg(Bank::Pred, 0))
            .with_jump_offset(5);
        emu.load_program(&[set, jmp], 0);

        for t in 0..4u32 {
            let dec = emu.fetch(t, 0);
            emu.execute(&dec);
        }
        let dec = emu.fetch(0, 1);
        let taken = emu.check_jump(&dec, 4);
        assert!(taken);
        for t in 0..4u32 {
            assert_eq!(emu.thread_pc(t), 6);
        }
    }

    #[test]
    fn untaken_jump_falls_through_together() {
        let mut emu = emulator();
        let jmp = ShaderInstr::new(Opcode::Jmp)
            .src(0, Operand::reg(Bank::Pred, 0))
            .with_jump_offset(5);
        emu.load_program(&[jmp], 0);
        // Predicates are false after reset; the AND reduction fails.
        let dec = emu.fetch(0, 0);
        let taken = emu.check_jump(&dec, 4);
        assert!(!taken);
        for t in 0..4u32 {
            assert_eq!(emu.thread_pc(t), 1);
        }
    }
}

mod checkpoint {
    use super::*;

    #[test]
    fn register_banks_round_trip() {
        let mut emu = emulator();
        emu.load_temp(0, 7, Vec4::new(1.0, 2.0, 3.0, 4.0));
        emu.load_input(0, 2, Vec4::splat(5.0));
        let blob = emu.checkpoint_thread(0);

        let mut other = emulator();
        other.restore_thread(0, &blob);
        assert_eq!(other.read_temp(0, 7), Vec4::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(other.read_input(0, 2), Vec4::splat(5.0));
    }
}
