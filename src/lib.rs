//! vexpr: a JIT-compiled per-pixel expression evaluator for video planes.
//!
//! Hosts hand over up to 26 input clips and one postfix expression per
//! output plane; construction tokenizes, decodes and compiles each
//! expression into a native SIMD kernel via Cranelift, and per frame the
//! kernel is applied to every pixel of the plane. See [`filter::ExprFilter`]
//! for the construction surface and [`jit::compile_plane`] for the
//! single-plane compiler underneath it.

pub mod decode;
pub mod filter;
pub mod format;
pub mod jit;
mod math;
pub mod op;
pub mod tokenize;

use thiserror::Error;

pub use decode::DecodeError;
pub use filter::{
    gather_consts, ExprFilter, FilterError, FilterParams, FrameProps, NoProps, PlaneMode,
    PropValue, ALIGNMENT, MAX_INPUTS,
};
pub use format::{ClipInfo, ColorFamily, PixelFormat, SampleType};
pub use jit::{compile_plane, CompiledPlane, JitError, Tuning, FLAG_USE_INTEGER, LANES};
pub use op::{CompileError, PropAccess};

#[derive(Debug, Error)]
pub enum ExprError {
    #[error(transparent)]
    Decode(#[from] decode::DecodeError),
    #[error(transparent)]
    Compile(#[from] op::CompileError),
    #[error(transparent)]
    Filter(#[from] filter::FilterError),
    #[error(transparent)]
    Jit(#[from] jit::JitError),
}

impl ExprError {
    /// The prefixed form hosts surface to users, e.g.
    /// `Expr: reference to undefined clip: a`.
    pub fn host_message(&self) -> String {
        format!("Expr: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn compile(expr: &str, out: PixelFormat, inputs: &[PixelFormat]) -> CompiledPlane {
        jit::compile_plane(expr, &out, inputs, 1, &Tuning::default())
            .expect("expression should compile")
    }

    fn compile_err(expr: &str, num_inputs: usize) -> String {
        let fmt = PixelFormat::gray_int(8);
        let inputs = vec![fmt; num_inputs];
        jit::compile_plane(expr, &fmt, &inputs, 1, &Tuning::default())
            .err()
            .expect("expression should be rejected")
            .host_message()
    }

    /// Runs `expr` over 8-bit grayscale sources sharing one width/height.
    fn run_u8(expr: &str, srcs: &[&[u8]], width: i32, height: i32) -> Vec<u8> {
        run_u8_frame(expr, srcs, width, height, 0)
    }

    fn run_u8_frame(expr: &str, srcs: &[&[u8]], width: i32, height: i32, n: i32) -> Vec<u8> {
        let fmt = PixelFormat::gray_int(8);
        let inputs = vec![fmt; srcs.len()];
        let plane = compile(expr, fmt, &inputs);
        let mut dst = vec![0u8; (width * height) as usize];
        let srcs: Vec<(&[u8], i32)> = srcs.iter().map(|s| (*s, width)).collect();
        let consts = gather_consts(n, plane.prop_access(), &NoProps);
        plane.run(&mut dst, width, &srcs, &consts, width, height);
        dst
    }

    fn f32_plane(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn f32_read(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn u16_plane(vals: &[u16]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn u16_read(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Runs `expr` with float output over 8-bit or float sources.
    fn run_to_f32(expr: &str, srcs: &[(&[u8], PixelFormat)], width: i32, height: i32) -> Vec<f32> {
        let out = PixelFormat::gray_float();
        let inputs: Vec<PixelFormat> = srcs.iter().map(|(_, f)| *f).collect();
        let plane = compile(expr, out, &inputs);
        let mut dst = vec![0u8; (width * height * 4) as usize];
        let srcs: Vec<(&[u8], i32)> = srcs
            .iter()
            .map(|(s, f)| (*s, width * f.bytes_per_sample as i32))
            .collect();
        let consts = gather_consts(0, plane.prop_access(), &NoProps);
        plane.run(&mut dst, width * 4, &srcs, &consts, width, height);
        f32_read(&dst)
    }

    #[test]
    fn adds_a_constant_to_a_uniform_plane() {
        let src = vec![100u8; 16 * 16];
        let out = run_u8("x 1 +", &[&src], 16, 16);
        assert!(out.iter().all(|&v| v == 101));
    }

    #[test]
    fn subtracts_two_clips() {
        let a = vec![200u8; 8 * 8];
        let b = vec![100u8; 8 * 8];
        let out = run_u8("x y -", &[&a, &b], 8, 8);
        assert!(out.iter().all(|&v| v == 100));
    }

    #[test]
    fn doubles_a_sixteen_bit_plane() {
        let fmt = PixelFormat::gray_int(16);
        let plane = compile("x 2 *", fmt, &[fmt]);
        let src = u16_plane(&vec![1000u16; 8 * 4]);
        let mut dst = vec![0u8; 8 * 4 * 2];
        let consts = gather_consts(0, plane.prop_access(), &NoProps);
        plane.run(&mut dst, 16, &[(&src, 16)], &consts, 8, 4);
        assert!(u16_read(&dst).iter().all(|&v| v == 2000));
    }

    #[test]
    fn sixteen_bit_output_saturates_at_its_depth() {
        let fmt = PixelFormat::gray_int(16);
        let plane = compile("x 100 *", fmt, &[fmt]);
        let src = u16_plane(&vec![1000u16; 8 * 2]);
        let mut dst = vec![0u8; 8 * 2 * 2];
        let consts = gather_consts(0, plane.prop_access(), &NoProps);
        plane.run(&mut dst, 16, &[(&src, 16)], &consts, 8, 2);
        assert!(u16_read(&dst).iter().all(|&v| v == 65535));
    }

    #[test]
    fn column_index_parity() {
        let src = vec![0u8; 64];
        let out = run_u8("X 2 %", &[&src], 64, 1);
        for (x, &v) in out.iter().enumerate() {
            assert_eq!(v as usize, x % 2, "column {x}");
        }
    }

    #[test]
    fn row_index_splat() {
        let src = vec![0u8; 8 * 4];
        let out = run_u8("Y", &[&src], 8, 4);
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v as usize, i / 8, "pixel {i}");
        }
    }

    #[test]
    fn frame_number_reaches_the_kernel() {
        let src = vec![0u8; 8 * 1];
        let out = run_u8_frame("N", &[&src], 8, 1, 7);
        assert!(out.iter().all(|&v| v == 7));
    }

    #[test]
    fn log_then_exp_round_trips() {
        let fmt = PixelFormat::gray_float();
        let src = f32_plane(&vec![0.5f32; 16]);
        let out = run_to_f32("x log exp", &[(&src, fmt)], 16, 1);
        for v in out {
            assert!((v - 0.5).abs() < 1e-4, "got {v}");
        }
    }

    #[test]
    fn ternary_on_comparison_matches_max() {
        let a: Vec<u8> = (0..64u32).map(|i| (i * 4 % 256) as u8).collect();
        let b: Vec<u8> = (0..64u32).map(|i| (255 - i * 3 % 256) as u8).collect();
        let selected = run_u8("x y > x y ?", &[&a, &b], 8, 8);
        let maxed = run_u8("x y max", &[&a, &b], 8, 8);
        assert_eq!(selected, maxed);
        for i in 0..64 {
            assert_eq!(selected[i], a[i].max(b[i]), "pixel {i}");
        }
    }

    #[test]
    fn algebraic_identities_round_trip() {
        let src: Vec<u8> = (0..128u32).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(run_u8("x", &[&src], 16, 8), src);
        assert_eq!(run_u8("x 1 *", &[&src], 16, 8), src);
        assert_eq!(run_u8("x 0 +", &[&src], 16, 8), src);
        assert!(run_u8("x dup -", &[&src], 16, 8).iter().all(|&v| v == 0));
        assert!(run_u8("x dup0 -", &[&src], 16, 8).iter().all(|&v| v == 0));
    }

    #[test]
    fn ternary_selects_between_branches() {
        let src: Vec<u8> = (0..16u8).map(|i| i % 2).collect();
        assert_eq!(run_u8("x 1 0 ?", &[&src], 16, 1), src);

        let ones = vec![1u8; 16];
        assert!(run_u8("x 0 1 ?", &[&ones], 16, 1).iter().all(|&v| v == 0));
    }

    #[test]
    fn integer_output_saturates_upward() {
        let src = vec![100u8; 16];
        let out = run_u8("256 x +", &[&src], 16, 1);
        assert!(out.iter().all(|&v| v == 255));
    }

    #[test]
    fn negative_intermediates_clamp_to_zero() {
        let src = vec![5u8; 16];
        let out = run_u8("x 10 -", &[&src], 16, 1);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn log_of_zero_poisons_the_lane() {
        let fmt = PixelFormat::gray_float();
        let src = f32_plane(&vec![0.0f32; 8]);
        let out = run_to_f32("x log", &[(&src, fmt)], 8, 1);
        assert!(out.iter().all(|v| v.is_nan()), "got {out:?}");
    }

    #[test]
    fn sqrt_clamps_negative_arguments() {
        let src = vec![0u8; 8];
        let out = run_to_f32("-1 sqrt", &[(&src, PixelFormat::gray_int(8))], 8, 1);
        assert!(out.iter().all(|&v| v == 0.0), "got {out:?}");
    }

    #[test]
    fn sine_of_half_pi() {
        let src = vec![0u8; 8];
        let out = run_to_f32("pi 2 / sin", &[(&src, PixelFormat::gray_int(8))], 8, 1);
        for v in out {
            assert!((v - 1.0).abs() < 1e-6, "got {v}");
        }
    }

    #[test]
    fn cosine_of_zero_is_exactly_one() {
        let src = vec![0u8; 8];
        let out = run_to_f32("0 cos", &[(&src, PixelFormat::gray_int(8))], 8, 1);
        assert!(out.iter().all(|&v| v == 1.0), "got {out:?}");
    }

    #[test]
    fn division_by_zero_flows_to_infinity() {
        let fmt = PixelFormat::gray_float();
        let src = f32_plane(&vec![1.0f32; 8]);
        let out = run_to_f32("x 0 /", &[(&src, fmt)], 8, 1);
        assert!(out.iter().all(|v| v.is_infinite() && *v > 0.0), "got {out:?}");
    }

    #[test]
    fn rounding_is_to_nearest_even() {
        let src = vec![100u8; 8];
        // 100 + 0.5 rounds to the even neighbour on store.
        let out = run_u8("x 0.5 +", &[&src], 8, 1);
        assert!(out.iter().all(|&v| v == 100), "got {out:?}");

        let src = vec![101u8; 8];
        let out = run_u8("x 0.5 +", &[&src], 8, 1);
        assert!(out.iter().all(|&v| v == 102), "got {out:?}");
    }

    #[test]
    fn float_rounding_operators() {
        let fmt = PixelFormat::gray_float();
        let src = f32_plane(&vec![2.7f32; 8]);
        assert!(run_to_f32("x trunc", &[(&src, fmt)], 8, 1)
            .iter()
            .all(|&v| v == 2.0));
        assert!(run_to_f32("x floor", &[(&src, fmt)], 8, 1)
            .iter()
            .all(|&v| v == 2.0));
        assert!(run_to_f32("x round", &[(&src, fmt)], 8, 1)
            .iter()
            .all(|&v| v == 3.0));

        let src = f32_plane(&vec![-1.5f32; 8]);
        assert!(run_to_f32("x round", &[(&src, fmt)], 8, 1)
            .iter()
            .all(|&v| v == -2.0));
    }

    #[test]
    fn comparison_and_logic_produce_unit_masks() {
        let src = vec![5u8; 8];
        assert!(run_u8("x 3 <", &[&src], 8, 1).iter().all(|&v| v == 0));
        assert!(run_u8("x 10 <", &[&src], 8, 1).iter().all(|&v| v == 1));
        assert!(run_u8("x 5 =", &[&src], 8, 1).iter().all(|&v| v == 1));
        assert!(run_u8("x 5 >=", &[&src], 8, 1).iter().all(|&v| v == 1));
        assert!(run_u8("x 0 and", &[&src], 8, 1).iter().all(|&v| v == 0));
        assert!(run_u8("x 0 or", &[&src], 8, 1).iter().all(|&v| v == 1));
        assert!(run_u8("x x xor", &[&src], 8, 1).iter().all(|&v| v == 0));
        assert!(run_u8("x not", &[&src], 8, 1).iter().all(|&v| v == 0));
        assert!(run_u8("0 not", &[&src], 8, 1).iter().all(|&v| v == 1));
    }

    #[test]
    fn abs_and_min_max_in_both_domains() {
        let src = vec![10u8; 8];
        assert!(run_u8("x 20 - abs", &[&src], 8, 1).iter().all(|&v| v == 10));
        assert!(run_u8("x 3 min", &[&src], 8, 1).iter().all(|&v| v == 3));
        assert!(run_u8("x 200 max", &[&src], 8, 1).iter().all(|&v| v == 200));

        let fmt = PixelFormat::gray_float();
        let src = f32_plane(&vec![-2.5f32; 8]);
        assert!(run_to_f32("x abs", &[(&src, fmt)], 8, 1)
            .iter()
            .all(|&v| v == 2.5));
    }

    #[test]
    fn pow_specializes_integer_exponents() {
        let src = vec![7u8; 8];
        assert!(run_u8("x 2 pow", &[&src], 8, 1).iter().all(|&v| v == 49));

        let src = vec![0u8; 8];
        let out = run_to_f32("2 -2 pow", &[(&src, PixelFormat::gray_int(8))], 8, 1);
        assert!(out.iter().all(|&v| v == 0.25), "got {out:?}");

        let src = vec![16u8; 8];
        let out = run_to_f32("x 0.5 pow", &[(&src, PixelFormat::gray_int(8))], 8, 1);
        for v in out {
            assert!((v - 4.0).abs() < 1e-3, "got {v}");
        }
    }

    #[test]
    fn swap_reorders_stack_depths() {
        let a = vec![10u8; 8];
        let b = vec![3u8; 8];
        // swap turns x y - into y x -.
        assert!(run_u8("x y swap -", &[&a, &b], 8, 1).iter().all(|&v| v == 0));
        let out = run_u8("y x swap -", &[&a, &b], 8, 1);
        assert!(out.iter().all(|&v| v == 7), "got {out:?}");

        let src = vec![0u8; 8];
        let out = run_u8("1 2 3 swap2 - -", &[&src], 8, 1);
        assert!(out.iter().all(|&v| v == 2), "got {out:?}");
    }

    #[test]
    fn dup_depths_copy_below_the_top() {
        let src = vec![0u8; 8];
        let out = run_u8("1 2 3 dup2 + + +", &[&src], 8, 1);
        assert!(out.iter().all(|&v| v == 7), "got {out:?}");
    }

    #[test]
    fn dup_beyond_stack_depth_is_rejected() {
        assert_eq!(
            compile_err("x x x dup3", 1),
            "Expr: insufficient values on stack: dup3"
        );
        // dup0 with a single value is fine.
        let src = vec![9u8; 8];
        assert!(run_u8("x dup0 *", &[&src], 8, 1).iter().all(|&v| v == 81));
    }

    #[test]
    fn compile_errors_carry_the_offending_token_or_expression() {
        assert_eq!(compile_err("a +", 1), "Expr: reference to undefined clip: a");
        assert_eq!(compile_err("+", 1), "Expr: insufficient values on stack: +");
        assert_eq!(
            compile_err("x y", 2),
            "Expr: unconsumed values on stack: x y"
        );
        assert_eq!(compile_err("", 1), "Expr: empty expression: ");
        assert_eq!(
            compile_err("foo", 1),
            "Expr: failed to convert 'foo' to float"
        );
    }

    #[test]
    fn repeated_references_to_one_clip_are_fine() {
        let src = vec![30u8; 8];
        assert!(run_u8("x x +", &[&src], 8, 1).iter().all(|&v| v == 60));
    }

    #[test]
    fn frame_properties_feed_the_kernel() {
        let fmt = PixelFormat::gray_int(8);
        let plane = compile("x x.gain +", fmt, &[fmt]);
        let pa = plane.prop_access();
        assert_eq!(pa.len(), 1);
        assert_eq!(
            pa[0],
            PropAccess {
                clip: 0,
                name: "gain".to_string()
            }
        );

        let mut props: HashMap<(usize, String), PropValue> = HashMap::new();
        props.insert((0, "gain".to_string()), PropValue::Int(10));
        let consts = gather_consts(0, plane.prop_access(), &props);

        let src = vec![100u8; 8];
        let mut dst = vec![0u8; 8];
        plane.run(&mut dst, 8, &[(&src, 8)], &consts, 8, 1);
        assert!(dst.iter().all(|&v| v == 110));
    }

    #[test]
    fn missing_properties_become_nan() {
        let out_fmt = PixelFormat::gray_float();
        let plane = compile("x.gain", out_fmt, &[PixelFormat::gray_int(8)]);
        let consts = gather_consts(0, plane.prop_access(), &NoProps);
        assert!(consts[1].is_nan());

        let src = vec![0u8; 8];
        let mut dst = vec![0u8; 32];
        plane.run(&mut dst, 32, &[(&src, 8)], &consts, 8, 1);
        assert!(f32_read(&dst).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn force_float_mode_matches_integer_mode() {
        let a: Vec<u8> = (0..64u32).map(|i| (i * 5 % 256) as u8).collect();
        let b: Vec<u8> = (0..64u32).map(|i| (i * 11 % 256) as u8).collect();
        let fmt = PixelFormat::gray_int(8);
        let consts = [0.0f32];

        let mut with_int = vec![0u8; 64];
        let plane = jit::compile_plane("x y max", &fmt, &[fmt, fmt], 1, &Tuning::default()).unwrap();
        plane.run(&mut with_int, 8, &[(&a, 8), (&b, 8)], &consts, 8, 8);

        let mut forced = vec![0u8; 64];
        let plane = jit::compile_plane("x y max", &fmt, &[fmt, fmt], 0, &Tuning::default()).unwrap();
        plane.run(&mut forced, 8, &[(&a, 8), (&b, 8)], &consts, 8, 8);

        assert_eq!(with_int, forced);
    }

    #[test]
    fn fast_math_tuning_stays_within_tolerance() {
        let tuning = Tuning {
            aggressive: true,
            fast_math: true,
        };
        let fmt = PixelFormat::gray_float();
        let plane = jit::compile_plane("x exp log", &fmt, &[fmt], 1, &tuning).unwrap();
        let src = f32_plane(&vec![1.25f32; 8]);
        let mut dst = vec![0u8; 32];
        plane.run(&mut dst, 32, &[(&src, 32)], &[0.0], 8, 1);
        for v in f32_read(&dst) {
            assert!((v - 1.25).abs() < 1e-4, "got {v}");
        }
    }

    #[test]
    fn filter_processes_planes_end_to_end() {
        let clips = [ClipInfo::new(PixelFormat::gray_int(8), 16, 4)];
        let filter = ExprFilter::new(&FilterParams::new(&clips, &["x 1 +"])).unwrap();
        assert_eq!(filter.num_planes(), 1);

        let src = vec![100u8; 16 * 4];
        let mut dst = vec![0u8; 16 * 4];
        filter.process_plane(0, 0, &mut dst, 16, &[(&src, 16)], &NoProps);
        assert!(dst.iter().all(|&v| v == 101));
    }

    #[test]
    fn filter_copy_mode_copies_clip_zero() {
        let clips = [ClipInfo::new(PixelFormat::yuv420_int(8), 16, 4)];
        let filter = ExprFilter::new(&FilterParams::new(&clips, &["x 1 +", ""])).unwrap();

        // Chroma plane of a 16x4 4:2:0 frame is 8x2.
        let src: Vec<u8> = (0..16u8).collect();
        let mut dst = vec![0u8; 16];
        filter.process_plane(1, 0, &mut dst, 8, &[(&src, 8)], &NoProps);
        assert_eq!(dst, src);
    }
}
