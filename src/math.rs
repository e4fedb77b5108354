//! Vector kernels for the transcendental helper functions.
//!
//! Each emitter writes straight-line Cranelift IR over one `f32x4` value
//! using the classical Cephes-style minimax approximations. The code
//! generator wraps these bodies in standalone module functions (`vexp`,
//! `vlog`, `vsin`, `vcos`) and calls them once per 4-lane half.

use cranelift::codegen::ir::Endianness;
use cranelift::prelude::*;

/// Emits `f32x4` math through a borrowed function builder.
pub(crate) struct VecEmitter<'a, 'b> {
    pub b: &'a mut FunctionBuilder<'b>,
    /// Fuse polynomial steps into `fma` instructions. Changes results at the
    /// last-ULP level only.
    pub fast_math: bool,
}

impl<'a, 'b> VecEmitter<'a, 'b> {
    fn splat_f(&mut self, v: f32) -> Value {
        let c = self.b.ins().f32const(Ieee32::with_float(v));
        self.b.ins().splat(types::F32X4, c)
    }

    fn splat_i(&mut self, v: i32) -> Value {
        let c = self.b.ins().iconst(types::I32, v as u32 as i64);
        self.b.ins().splat(types::I32X4, c)
    }

    /// Splat of the float whose IEEE-754 bit pattern is `bits`.
    fn splat_bits(&mut self, bits: u32) -> Value {
        self.splat_f(f32::from_bits(bits))
    }

    fn as_int(&mut self, v: Value) -> Value {
        let flags = MemFlags::new().with_endianness(Endianness::Little);
        self.b.ins().bitcast(types::I32X4, flags, v)
    }

    fn as_float(&mut self, v: Value) -> Value {
        let flags = MemFlags::new().with_endianness(Endianness::Little);
        self.b.ins().bitcast(types::F32X4, flags, v)
    }

    /// `a * b + c`, fused when fast-math is on.
    fn mul_add(&mut self, a: Value, b: Value, c: Value) -> Value {
        if self.fast_math {
            self.b.ins().fma(a, b, c)
        } else {
            let prod = self.b.ins().fmul(a, b);
            self.b.ins().fadd(prod, c)
        }
    }

    /// Round to nearest even and convert to `i32x4`.
    fn round_int(&mut self, v: Value) -> Value {
        let rounded = self.b.ins().nearest(v);
        self.b.ins().fcvt_to_sint_sat(types::I32X4, rounded)
    }

    /// `e^x` with the argument clamped to the binary32-representable range,
    /// decomposed as `x = k*ln2 + r` and rebuilt by biasing the exponent.
    pub fn emit_exp(&mut self, x: Value) -> Value {
        const EXP_HI: f32 = 88.376_263;
        const LOG2E: f32 = 1.442_695_04;
        const EXP_C1: f32 = 0.693_359_375;
        const EXP_C2: f32 = -2.121_944_4e-4;
        const EXP_P: [f32; 6] = [
            1.987_569_15e-4,
            1.398_199_950_7e-3,
            8.333_451_907_3e-3,
            4.166_579_589_4e-2,
            1.666_666_545_9e-1,
            5.000_000_120_1e-1,
        ];

        let hi = self.splat_f(EXP_HI);
        let lo = self.splat_f(-EXP_HI);
        let mut x = self.b.ins().fmin(x, hi);
        x = self.b.ins().fmax(x, lo);

        // k = floor(x*log2e + 0.5), computed as round minus a correction.
        let log2e = self.splat_f(LOG2E);
        let half = self.splat_f(0.5);
        let mut fx = self.mul_add(log2e, x, half);
        let emm0 = self.round_int(fx);
        let etmp = self.b.ins().fcvt_from_sint(types::F32X4, emm0);
        let one_bits = self.splat_f(1.0);
        let one_bits = self.as_int(one_bits);
        let gt = self.b.ins().fcmp(FloatCC::GreaterThan, etmp, fx);
        let corr_bits = self.b.ins().band(one_bits, gt);
        let corr = self.as_float(corr_bits);
        fx = self.b.ins().fsub(etmp, corr);

        let c1 = self.splat_f(-EXP_C1);
        x = self.mul_add(fx, c1, x);
        let c2 = self.splat_f(-EXP_C2);
        x = self.mul_add(fx, c2, x);

        let z = self.b.ins().fmul(x, x);
        let mut y = self.splat_f(EXP_P[0]);
        for p in &EXP_P[1..] {
            let c = self.splat_f(*p);
            y = self.mul_add(y, x, c);
        }
        y = self.mul_add(y, z, x);
        let one = self.splat_f(1.0);
        y = self.b.ins().fadd(y, one);

        // Scale by 2^k through the exponent field.
        let emm0 = self.round_int(fx);
        let bias = self.splat_i(0x7f);
        let emm0 = self.b.ins().iadd(emm0, bias);
        let shift = self.b.ins().iconst(types::I32, 23);
        let emm0 = self.b.ins().ishl(emm0, shift);
        let scale = self.as_float(emm0);
        self.b.ins().fmul(y, scale)
    }

    /// Natural log via mantissa/exponent split. Non-positive lanes come out
    /// as NaN (an all-ones mask is OR-ed onto the result bits).
    pub fn emit_log(&mut self, x: Value) -> Value {
        const MIN_NORM_POS: i32 = 0x0080_0000;
        const INV_MANT_MASK: i32 = !0x7f80_0000u32 as i32;
        const SQRT_HALF: f32 = 0.707_106_78;
        const LOG_P: [f32; 9] = [
            7.037_683_629_2e-2,
            -1.151_461_031e-1,
            1.167_699_874e-1,
            -1.242_014_084_6e-1,
            1.424_932_278_7e-1,
            -1.666_805_766_5e-1,
            2.000_071_476_5e-1,
            -2.499_999_399_3e-1,
            3.333_333_117_4e-1,
        ];
        const LOG_Q1: f32 = -2.121_944_4e-4;
        const LOG_Q2: f32 = 0.693_359_375;

        let zero = self.splat_f(0.0);
        let invalid_mask = self.b.ins().fcmp(FloatCC::LessThanOrEqual, x, zero);

        let min_norm = self.splat_bits(MIN_NORM_POS as u32);
        let x = self.b.ins().fmax(x, min_norm);

        let x_bits = self.as_int(x);
        let shift = self.b.ins().iconst(types::I32, 23);
        let emm0i = self.b.ins().sshr(x_bits, shift);

        // Mantissa into [0.5, 1).
        let mant_mask = self.splat_i(INV_MANT_MASK);
        let mant = self.b.ins().band(x_bits, mant_mask);
        let half_f = self.splat_f(0.5);
        let half_bits = self.as_int(half_f);
        let mant = self.b.ins().bor(mant, half_bits);
        let mut x = self.as_float(mant);

        let bias = self.splat_i(0x7f);
        let emm0i = self.b.ins().isub(emm0i, bias);
        let mut emm0 = self.b.ins().fcvt_from_sint(types::F32X4, emm0i);
        let one = self.splat_f(1.0);
        emm0 = self.b.ins().fadd(emm0, one);

        // Mantissa below sqrt(1/2): halve the exponent's contribution and
        // double the mantissa term.
        let sqrt_half = self.splat_f(SQRT_HALF);
        let mask = self.b.ins().fcmp(FloatCC::LessThan, x, sqrt_half);
        let x_bits = self.as_int(x);
        let etmp_bits = self.b.ins().band(mask, x_bits);
        let etmp = self.as_float(etmp_bits);
        x = self.b.ins().fsub(x, one);
        let one_bits = self.as_int(one);
        let maskf_bits = self.b.ins().band(mask, one_bits);
        let maskf = self.as_float(maskf_bits);
        emm0 = self.b.ins().fsub(emm0, maskf);
        x = self.b.ins().fadd(x, etmp);

        let z = self.b.ins().fmul(x, x);
        let mut y = self.splat_f(LOG_P[0]);
        for p in &LOG_P[1..] {
            let c = self.splat_f(*p);
            y = self.mul_add(y, x, c);
        }
        y = self.b.ins().fmul(y, x);
        y = self.b.ins().fmul(y, z);

        let q1 = self.splat_f(LOG_Q1);
        y = self.mul_add(emm0, q1, y);
        let neg_half = self.splat_f(-0.5);
        y = self.mul_add(z, neg_half, y);
        x = self.b.ins().fadd(x, y);
        let q2 = self.splat_f(LOG_Q2);
        x = self.mul_add(emm0, q2, x);

        let x_bits = self.as_int(x);
        let poisoned = self.b.ins().bor(invalid_mask, x_bits);
        self.as_float(poisoned)
    }

    /// Shared sine/cosine body. Reduces to `[-pi/2, pi/2]` with a four-step
    /// Cody-Waite subtraction and folds quadrant parity into the sign bit.
    pub fn emit_sincos(&mut self, x: Value, is_sin: bool) -> Value {
        const INV_PI: u32 = 0x3ea2_f983;
        const PI_PARTS: [u32; 4] = [0x4049_0000, 0x3a7d_a000, 0x3422_2000, 0x2cb4_611a];
        const SIN_C: [u32; 4] = [0x362e_def8, 0xb94f_b7ff, 0x3c08_876a, 0xbe2a_aaa6];
        const COS_C: [u32; 4] = [0x37c1_ad76, 0xbab5_8d50, 0x3d2a_a73c, 0xbeff_ffe2];

        let mut sign = if is_sin {
            let x_bits = self.as_int(x);
            let sign_mask = self.splat_i(0x8000_0000u32 as i32);
            self.b.ins().band(x_bits, sign_mask)
        } else {
            self.splat_i(0)
        };

        let mut t1 = self.b.ins().fabs(x);

        // k = round(|x| / pi); odd k flips the sign.
        let inv_pi = self.splat_bits(INV_PI);
        let t2 = self.b.ins().fmul(t1, inv_pi);
        let t2i = self.round_int(t2);
        let thirty_one = self.b.ins().iconst(types::I32, 31);
        let parity = self.b.ins().ishl(t2i, thirty_one);
        sign = self.b.ins().bxor(sign, parity);
        let t2 = self.b.ins().fcvt_from_sint(types::F32X4, t2i);

        for part in PI_PARTS {
            let c = self.splat_f(-f32::from_bits(part));
            t1 = self.mul_add(t2, c, t1);
        }

        let result = if is_sin {
            // x + x * x^2 * (C3 + x^2 * (C5 + x^2 * (C7 + x^2 * C9)))
            let sq = self.b.ins().fmul(t1, t1);
            let c9 = self.splat_bits(SIN_C[0]);
            let c7 = self.splat_bits(SIN_C[1]);
            let mut t3 = self.mul_add(sq, c9, c7);
            for c in &SIN_C[2..] {
                let c = self.splat_bits(*c);
                t3 = self.mul_add(t3, sq, c);
            }
            t3 = self.b.ins().fmul(t3, sq);
            t3 = self.b.ins().fmul(t3, t1);
            self.b.ins().fadd(t1, t3)
        } else {
            // 1 + x^2 * (C2 + x^2 * (C4 + x^2 * (C6 + x^2 * C8)))
            let sq = self.b.ins().fmul(t1, t1);
            let c8 = self.splat_bits(COS_C[0]);
            let c6 = self.splat_bits(COS_C[1]);
            let mut t2 = self.mul_add(sq, c8, c6);
            for c in &COS_C[2..] {
                let c = self.splat_bits(*c);
                t2 = self.mul_add(t2, sq, c);
            }
            let one = self.splat_f(1.0);
            self.mul_add(t2, sq, one)
        };

        let result_bits = self.as_int(result);
        let signed = self.b.ins().bxor(sign, result_bits);
        self.as_float(signed)
    }
}
