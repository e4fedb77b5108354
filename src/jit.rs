//! SIMD code generator and module finalizer.
//!
//! One compiled plane is a Cranelift `JITModule` holding the transcendental
//! helper functions plus a `proc_plane` kernel of the shape
//! `(rwptrs, strides, consts, width, height) -> ()`. The kernel is a `y`/`x`
//! double loop; per step it evaluates the postfix program over `LANES`
//! pixels, tracking int/float lanes on a symbolic stack that exists only
//! while code is generated. Cranelift vectors are 128-bit, so every 8-lane
//! value is a lo/hi pair of `i32x4`/`f32x4` registers.

use crate::format::{PixelFormat, SampleType};
use crate::math::VecEmitter;
use crate::op::{dedup_prop_access, Cmp, CompileError, ConstLoad, Op, PropAccess};
use crate::{decode, filter::FilterError, tokenize::tokenize, ExprError};
use cranelift::codegen::ir::Endianness;
use cranelift::codegen::settings::{self, Configurable};
use cranelift::codegen::CodegenError;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use thiserror::Error;

/// Pixels processed per inner-loop step.
pub const LANES: usize = 8;
/// Copies of the lowered program per step. The loop advances by
/// `LANES * UNROLL` columns, which the host must keep `width` divisible by.
const UNROLL: usize = 1;

/// Bit 0 of the `opt` mask: keep integral operands in integer lanes. When
/// clear, every integer value is promoted to float as soon as it appears.
pub const FLAG_USE_INTEGER: u32 = 1 << 0;

/// Coarse backend knobs. `aggressive` selects the optimizing pass pipeline;
/// `fast_math` fuses polynomial multiply-adds, which moves transcendental
/// results by at most an ULP.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub aggressive: bool,
    pub fast_math: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            aggressive: true,
            fast_math: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum JitError {
    #[error("host ISA is not supported: {0}")]
    HostIsa(&'static str),
    #[error("invalid JIT flag: {0}")]
    Flag(String),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Module(#[from] cranelift_module::ModuleError),
}

type KernelFn = unsafe extern "C" fn(*const *mut u8, *const i32, *const f32, i32, i32);

/// A finalized per-plane kernel plus the property table the host must
/// materialize into the scalar-constants buffer every frame.
pub struct CompiledPlane {
    // Owns the executable pages `entry` points into.
    _module: JITModule,
    entry: *const u8,
    prop_access: Vec<PropAccess>,
    out_format: PixelFormat,
    in_formats: Vec<PixelFormat>,
}

impl std::fmt::Debug for CompiledPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPlane")
            .field("entry", &self.entry)
            .field("prop_access", &self.prop_access)
            .field("out_format", &self.out_format)
            .field("in_formats", &self.in_formats)
            .finish()
    }
}

// SAFETY: the JITModule's code pages are immutable once finalized and live
// as long as `_module`. The kernel itself only reads and writes through the
// pointers it is handed, so concurrent calls on different frames are fine.
unsafe impl Send for CompiledPlane {}
unsafe impl Sync for CompiledPlane {}

impl CompiledPlane {
    /// Property accesses in scalar-constant slot order (slot 0 is the frame
    /// number, properties start at slot 1).
    pub fn prop_access(&self) -> &[PropAccess] {
        &self.prop_access
    }

    pub fn output_format(&self) -> &PixelFormat {
        &self.out_format
    }

    /// Invokes the kernel through its raw ABI.
    ///
    /// # Safety
    ///
    /// `rwptrs` must hold the destination pointer followed by one source
    /// pointer per input clip, `strides` the matching byte strides, and
    /// `consts` at least `1 + prop_access().len()` floats. `width` must be a
    /// multiple of `LANES * UNROLL` and every plane must cover
    /// `width * height` pixels at its stride.
    pub unsafe fn call_raw(
        &self,
        rwptrs: *const *mut u8,
        strides: *const i32,
        consts: *const f32,
        width: i32,
        height: i32,
    ) {
        let proc: KernelFn = std::mem::transmute(self.entry);
        proc(rwptrs, strides, consts, width, height);
    }

    /// Bounds-checked slice front end over [`CompiledPlane::call_raw`].
    pub fn run(
        &self,
        dst: &mut [u8],
        dst_stride: i32,
        srcs: &[(&[u8], i32)],
        consts: &[f32],
        width: i32,
        height: i32,
    ) {
        assert!(width > 0 && height > 0, "empty plane");
        assert_eq!(
            width as usize % (LANES * UNROLL),
            0,
            "width must be a multiple of {}",
            LANES * UNROLL
        );
        assert_eq!(
            srcs.len(),
            self.in_formats.len(),
            "one source plane per input clip"
        );
        assert!(
            consts.len() > self.prop_access.len(),
            "scalar-constants buffer too small"
        );
        assert!(
            dst.len() >= plane_bytes(dst_stride, width, height, self.out_format.bytes_per_sample),
            "destination plane too small"
        );
        for ((buf, stride), fmt) in srcs.iter().zip(&self.in_formats) {
            assert!(
                buf.len() >= plane_bytes(*stride, width, height, fmt.bytes_per_sample),
                "source plane too small"
            );
        }

        let mut rwptrs: Vec<*mut u8> = Vec::with_capacity(1 + srcs.len());
        let mut strides: Vec<i32> = Vec::with_capacity(1 + srcs.len());
        rwptrs.push(dst.as_mut_ptr());
        strides.push(dst_stride);
        for (buf, stride) in srcs {
            rwptrs.push(buf.as_ptr() as *mut u8);
            strides.push(*stride);
        }

        unsafe {
            self.call_raw(
                rwptrs.as_ptr(),
                strides.as_ptr(),
                consts.as_ptr(),
                width,
                height,
            );
        }
    }
}

fn plane_bytes(stride: i32, width: i32, height: i32, bytes_per_sample: u32) -> usize {
    (height - 1) as usize * stride as usize + width as usize * bytes_per_sample as usize
}

/// Compiles one expression into a callable plane kernel.
pub fn compile_plane(
    expr: &str,
    out: &PixelFormat,
    inputs: &[PixelFormat],
    opt: u32,
    tuning: &Tuning,
) -> Result<CompiledPlane, ExprError> {
    if !out.is_supported() || inputs.iter().any(|f| !f.is_supported()) {
        return Err(FilterError::UnsupportedFormat.into());
    }

    let tokens = tokenize(expr);
    let mut ops = decode::decode(&tokens)?;
    let prop_access = dedup_prop_access(&mut ops, &tokens, inputs.len())?;

    let mut module = create_module(tuning)?;
    let helpers = build_helpers(&mut module, tuning)?;
    let force_float = opt & FLAG_USE_INTEGER == 0;
    let entry_id = build_kernel(
        &mut module,
        &helpers,
        expr,
        &tokens,
        &ops,
        out,
        inputs,
        force_float,
    )?;
    module.finalize_definitions().map_err(JitError::from)?;
    let entry = module.get_finalized_function(entry_id);

    Ok(CompiledPlane {
        _module: module,
        entry,
        prop_access,
        out_format: *out,
        in_formats: inputs.to_vec(),
    })
}

fn create_module(tuning: &Tuning) -> Result<JITModule, JitError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", if tuning.aggressive { "speed" } else { "none" })
        .map_err(|e| JitError::Flag(e.to_string()))?;
    let isa_builder = cranelift_native::builder().map_err(JitError::HostIsa)?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder))?;
    let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    Ok(JITModule::new(builder))
}

/// The transcendental helpers, declared in the same module as the kernel and
/// called by reference once per 128-bit half.
struct Helpers {
    exp: FuncId,
    log: FuncId,
    sin: FuncId,
    cos: FuncId,
    pow: FuncId,
}

enum UnaryHelper {
    Sin,
    Cos,
    Exp,
    Log,
}

fn unary_sig(module: &JITModule) -> Signature {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F32X4));
    sig.returns.push(AbiParam::new(types::F32X4));
    sig
}

fn binary_sig(module: &JITModule) -> Signature {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F32X4));
    sig.params.push(AbiParam::new(types::F32X4));
    sig.returns.push(AbiParam::new(types::F32X4));
    sig
}

fn build_helpers(module: &mut JITModule, tuning: &Tuning) -> Result<Helpers, JitError> {
    let sig1 = unary_sig(module);
    let sig2 = binary_sig(module);

    let sin = module.declare_function("vsin", Linkage::Local, &sig1)?;
    let cos = module.declare_function("vcos", Linkage::Local, &sig1)?;
    let exp = module.declare_function("vexp", Linkage::Local, &sig1)?;
    let log = module.declare_function("vlog", Linkage::Local, &sig1)?;
    let pow = module.declare_function("vpow", Linkage::Local, &sig2)?;

    define_unary_helper(module, sin, UnaryHelper::Sin, tuning)?;
    define_unary_helper(module, cos, UnaryHelper::Cos, tuning)?;
    define_unary_helper(module, exp, UnaryHelper::Exp, tuning)?;
    define_unary_helper(module, log, UnaryHelper::Log, tuning)?;
    define_pow_helper(module, pow, exp, log)?;

    Ok(Helpers {
        exp,
        log,
        sin,
        cos,
        pow,
    })
}

fn define_unary_helper(
    module: &mut JITModule,
    id: FuncId,
    kind: UnaryHelper,
    tuning: &Tuning,
) -> Result<(), JitError> {
    let mut ctx = module.make_context();
    ctx.func.signature = unary_sig(module);
    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);
        let x = b.block_params(entry)[0];
        let result = {
            let mut em = VecEmitter {
                b: &mut b,
                fast_math: tuning.fast_math,
            };
            match kind {
                UnaryHelper::Sin => em.emit_sincos(x, true),
                UnaryHelper::Cos => em.emit_sincos(x, false),
                UnaryHelper::Exp => em.emit_exp(x),
                UnaryHelper::Log => em.emit_log(x),
            }
        };
        b.ins().return_(&[result]);
        b.finalize();
    }
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(())
}

/// `vpow(x, y) = vexp(vlog(x) * y)`, composed from the sibling helpers.
fn define_pow_helper(
    module: &mut JITModule,
    id: FuncId,
    exp: FuncId,
    log: FuncId,
) -> Result<(), JitError> {
    let mut ctx = module.make_context();
    ctx.func.signature = binary_sig(module);
    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);
        let x = b.block_params(entry)[0];
        let y = b.block_params(entry)[1];

        let log_ref = module.declare_func_in_func(log, b.func);
        let exp_ref = module.declare_func_in_func(exp, b.func);
        let call = b.ins().call(log_ref, &[x]);
        let logx = b.inst_results(call)[0];
        let scaled = b.ins().fmul(logx, y);
        let call = b.ins().call(exp_ref, &[scaled]);
        let result = b.inst_results(call)[0];
        b.ins().return_(&[result]);
        b.finalize();
    }
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(())
}

/// An 8-lane value as two 128-bit registers.
#[derive(Clone, Copy)]
struct Half2 {
    lo: Value,
    hi: Value,
}

/// Lane representation of one symbolic stack entry.
#[derive(Clone, Copy)]
enum Vec8 {
    Int(Half2),
    Float(Half2),
}

#[derive(Clone, Copy)]
enum Literal {
    Int(i32),
    Float(f32),
}

/// One entry of the generation-time stack: the lane pair plus, for pushed
/// literals, the constant it folded from (the integer `pow` specialization
/// keys on it).
#[derive(Clone, Copy)]
struct StackValue {
    vec: Vec8,
    literal: Option<Literal>,
}

impl StackValue {
    fn of(vec: Vec8) -> Self {
        StackValue { vec, literal: None }
    }
}

/// Loop-invariant values threaded through per-iteration lowering.
struct KernelState {
    wptrs: Vec<Value>,
    strides: Vec<Value>,
    consts: Value,
    xvec: Half2,
    x: Variable,
    y: Variable,
}

fn float_cc(kind: Cmp) -> FloatCC {
    match kind {
        Cmp::Eq => FloatCC::Equal,
        Cmp::Lt => FloatCC::LessThan,
        Cmp::Le => FloatCC::LessThanOrEqual,
        Cmp::Neq => FloatCC::NotEqual,
        Cmp::Nlt => FloatCC::UnorderedOrGreaterThanOrEqual,
        Cmp::Nle => FloatCC::UnorderedOrGreaterThan,
    }
}

fn int_cc(kind: Cmp) -> IntCC {
    match kind {
        Cmp::Eq => IntCC::Equal,
        Cmp::Lt => IntCC::SignedLessThan,
        Cmp::Le => IntCC::SignedLessThanOrEqual,
        Cmp::Neq => IntCC::NotEqual,
        Cmp::Nlt => IntCC::SignedGreaterThanOrEqual,
        Cmp::Nle => IntCC::SignedGreaterThan,
    }
}

struct PlaneCompiler<'a, 'b> {
    b: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    helpers: &'a Helpers,
    out: PixelFormat,
    inputs: &'a [PixelFormat],
    force_float: bool,
    ptr_type: Type,
}

impl<'a, 'b> PlaneCompiler<'a, 'b> {
    fn splat_ic(&mut self, v: i32) -> Half2 {
        let c = self.b.ins().iconst(types::I32, v as u32 as i64);
        let s = self.b.ins().splat(types::I32X4, c);
        Half2 { lo: s, hi: s }
    }

    fn splat_fc(&mut self, v: f32) -> Half2 {
        let c = self.b.ins().f32const(Ieee32::with_float(v));
        let s = self.b.ins().splat(types::F32X4, c);
        Half2 { lo: s, hi: s }
    }

    fn splat_int_scalar(&mut self, v: Value) -> Half2 {
        let s = self.b.ins().splat(types::I32X4, v);
        Half2 { lo: s, hi: s }
    }

    fn splat_float_scalar(&mut self, v: Value) -> Half2 {
        let s = self.b.ins().splat(types::F32X4, v);
        Half2 { lo: s, hi: s }
    }

    fn iadd2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().iadd(a.lo, b.lo),
            hi: self.b.ins().iadd(a.hi, b.hi),
        }
    }

    fn isub2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().isub(a.lo, b.lo),
            hi: self.b.ins().isub(a.hi, b.hi),
        }
    }

    fn imul2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().imul(a.lo, b.lo),
            hi: self.b.ins().imul(a.hi, b.hi),
        }
    }

    fn smin2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().smin(a.lo, b.lo),
            hi: self.b.ins().smin(a.hi, b.hi),
        }
    }

    fn smax2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().smax(a.lo, b.lo),
            hi: self.b.ins().smax(a.hi, b.hi),
        }
    }

    fn iabs2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().iabs(a.lo),
            hi: self.b.ins().iabs(a.hi),
        }
    }

    fn band2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().band(a.lo, b.lo),
            hi: self.b.ins().band(a.hi, b.hi),
        }
    }

    fn bor2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().bor(a.lo, b.lo),
            hi: self.b.ins().bor(a.hi, b.hi),
        }
    }

    fn bxor2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().bxor(a.lo, b.lo),
            hi: self.b.ins().bxor(a.hi, b.hi),
        }
    }

    fn bnot2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().bnot(a.lo),
            hi: self.b.ins().bnot(a.hi),
        }
    }

    fn fadd2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fadd(a.lo, b.lo),
            hi: self.b.ins().fadd(a.hi, b.hi),
        }
    }

    fn fsub2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fsub(a.lo, b.lo),
            hi: self.b.ins().fsub(a.hi, b.hi),
        }
    }

    fn fmul2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fmul(a.lo, b.lo),
            hi: self.b.ins().fmul(a.hi, b.hi),
        }
    }

    fn fdiv2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fdiv(a.lo, b.lo),
            hi: self.b.ins().fdiv(a.hi, b.hi),
        }
    }

    fn fmin2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fmin(a.lo, b.lo),
            hi: self.b.ins().fmin(a.hi, b.hi),
        }
    }

    fn fmax2(&mut self, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fmax(a.lo, b.lo),
            hi: self.b.ins().fmax(a.hi, b.hi),
        }
    }

    fn fabs2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fabs(a.lo),
            hi: self.b.ins().fabs(a.hi),
        }
    }

    fn sqrt2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().sqrt(a.lo),
            hi: self.b.ins().sqrt(a.hi),
        }
    }

    fn trunc2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().trunc(a.lo),
            hi: self.b.ins().trunc(a.hi),
        }
    }

    fn floor2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().floor(a.lo),
            hi: self.b.ins().floor(a.hi),
        }
    }

    fn nearest2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().nearest(a.lo),
            hi: self.b.ins().nearest(a.hi),
        }
    }

    fn icmp2(&mut self, cc: IntCC, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().icmp(cc, a.lo, b.lo),
            hi: self.b.ins().icmp(cc, a.hi, b.hi),
        }
    }

    fn fcmp2(&mut self, cc: FloatCC, a: Half2, b: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fcmp(cc, a.lo, b.lo),
            hi: self.b.ins().fcmp(cc, a.hi, b.hi),
        }
    }

    fn int_to_float2(&mut self, a: Half2) -> Half2 {
        Half2 {
            lo: self.b.ins().fcvt_from_sint(types::F32X4, a.lo),
            hi: self.b.ins().fcvt_from_sint(types::F32X4, a.hi),
        }
    }

    /// Round to nearest even, then convert to integer lanes.
    fn round_int2(&mut self, a: Half2) -> Half2 {
        let rounded = self.nearest2(a);
        Half2 {
            lo: self.b.ins().fcvt_to_sint_sat(types::I32X4, rounded.lo),
            hi: self.b.ins().fcvt_to_sint_sat(types::I32X4, rounded.hi),
        }
    }

    fn vec_flags() -> MemFlags {
        MemFlags::new().with_endianness(Endianness::Little)
    }

    fn bits_of2(&mut self, a: Half2) -> Half2 {
        let flags = Self::vec_flags();
        Half2 {
            lo: self.b.ins().bitcast(types::I32X4, flags, a.lo),
            hi: self.b.ins().bitcast(types::I32X4, flags, a.hi),
        }
    }

    fn float_of_bits2(&mut self, a: Half2) -> Half2 {
        let flags = Self::vec_flags();
        Half2 {
            lo: self.b.ins().bitcast(types::F32X4, flags, a.lo),
            hi: self.b.ins().bitcast(types::F32X4, flags, a.hi),
        }
    }

    fn ensure_float(&mut self, v: Vec8) -> Half2 {
        match v {
            Vec8::Float(h) => h,
            Vec8::Int(h) => self.int_to_float2(h),
        }
    }

    /// Pushes an integer result, honoring the force-float mode.
    fn push_int_result(&mut self, stack: &mut Vec<StackValue>, h: Half2) {
        if self.force_float {
            let f = self.int_to_float2(h);
            stack.push(StackValue::of(Vec8::Float(f)));
        } else {
            stack.push(StackValue::of(Vec8::Int(h)));
        }
    }

    /// Lane mask of `v > 0`, evaluated in the value's own domain.
    fn truth_mask(&mut self, v: Vec8) -> Half2 {
        match v {
            Vec8::Float(h) => {
                let zero = self.splat_fc(0.0);
                self.fcmp2(FloatCC::GreaterThan, h, zero)
            }
            Vec8::Int(h) => {
                let zero = self.splat_ic(0);
                self.icmp2(IntCC::SignedGreaterThan, h, zero)
            }
        }
    }

    fn call_unary(&mut self, id: FuncId, h: Half2) -> Half2 {
        let func_ref = self.module.declare_func_in_func(id, self.b.func);
        let call = self.b.ins().call(func_ref, &[h.lo]);
        let lo = self.b.inst_results(call)[0];
        let call = self.b.ins().call(func_ref, &[h.hi]);
        let hi = self.b.inst_results(call)[0];
        Half2 { lo, hi }
    }

    fn call_binary(&mut self, id: FuncId, a: Half2, b: Half2) -> Half2 {
        let func_ref = self.module.declare_func_in_func(id, self.b.func);
        let call = self.b.ins().call(func_ref, &[a.lo, b.lo]);
        let lo = self.b.inst_results(call)[0];
        let call = self.b.ins().call(func_ref, &[a.hi, b.hi]);
        let hi = self.b.inst_results(call)[0];
        Half2 { lo, hi }
    }

    /// Exponentiation by squaring for a generation-time-constant integer
    /// exponent; negative exponents take a final reciprocal.
    fn emit_powi(&mut self, base: Half2, n: i32) -> Half2 {
        let mut result = self.splat_fc(1.0);
        let mut acc = base;
        let mut e = n.unsigned_abs();
        while e > 0 {
            if e & 1 == 1 {
                result = self.fmul2(result, acc);
            }
            e >>= 1;
            if e > 0 {
                acc = self.fmul2(acc, acc);
            }
        }
        if n < 0 {
            let one = self.splat_fc(1.0);
            result = self.fdiv2(one, result);
        }
        result
    }

    /// Byte address of the current pixel batch in plane `idx` of the
    /// pointer/stride tables (0 = destination, `1 + clip` = sources).
    fn pixel_addr(&mut self, state: &KernelState, idx: usize, bytes_per_sample: u32) -> Value {
        let y = self.b.use_var(state.y);
        let x = self.b.use_var(state.x);
        let row = self.b.ins().imul(y, state.strides[idx]);
        let sample_bytes = self.b.ins().iconst(types::I32, bytes_per_sample as i64);
        let col = self.b.ins().imul(x, sample_bytes);
        let offset = self.b.ins().iadd(row, col);
        let offset = if self.ptr_type == types::I64 {
            self.b.ins().sextend(types::I64, offset)
        } else {
            offset
        };
        self.b.ins().iadd(state.wptrs[idx], offset)
    }

    fn emit_mem_load(&mut self, state: &KernelState, clip: usize) -> StackValue {
        let fmt = self.inputs[clip];
        let addr = self.pixel_addr(state, clip + 1, fmt.bytes_per_sample);
        let flags = MemFlags::new();
        let vec = match (fmt.sample_type, fmt.bytes_per_sample) {
            (SampleType::Integer, 1) => {
                let wide = self.b.ins().uload8x8(flags, addr, 0);
                Vec8::Int(Half2 {
                    lo: self.b.ins().uwiden_low(wide),
                    hi: self.b.ins().uwiden_high(wide),
                })
            }
            (SampleType::Integer, 2) => {
                let wide = self.b.ins().load(types::I16X8, flags, addr, 0);
                Vec8::Int(Half2 {
                    lo: self.b.ins().uwiden_low(wide),
                    hi: self.b.ins().uwiden_high(wide),
                })
            }
            (SampleType::Float, 4) => Vec8::Float(Half2 {
                lo: self.b.ins().load(types::F32X4, flags, addr, 0),
                hi: self.b.ins().load(types::F32X4, flags, addr, 16),
            }),
            _ => unreachable!("unsupported input formats are rejected at construction"),
        };
        match vec {
            Vec8::Int(h) if self.force_float => {
                let f = self.int_to_float2(h);
                StackValue::of(Vec8::Float(f))
            }
            other => StackValue::of(other),
        }
    }

    /// Clamp, convert and narrow the final value into the destination plane.
    fn emit_store(&mut self, state: &KernelState, res: StackValue) {
        let fmt = self.out;
        let addr = self.pixel_addr(state, 0, fmt.bytes_per_sample);
        let flags = MemFlags::new();
        match fmt.sample_type {
            SampleType::Integer => {
                let maxval = (1i64 << fmt.bits_per_sample) - 1;
                let clamped = match res.vec {
                    Vec8::Float(h) => {
                        let zero = self.splat_fc(0.0);
                        let maxf = self.splat_fc(maxval as f32);
                        let low = self.fmax2(h, zero);
                        let both = self.fmin2(low, maxf);
                        self.round_int2(both)
                    }
                    Vec8::Int(h) => {
                        let zero = self.splat_ic(0);
                        let maxi = self.splat_ic(maxval as i32);
                        let low = self.smax2(h, zero);
                        self.smin2(low, maxi)
                    }
                };
                let packed16 = self.b.ins().unarrow(clamped.lo, clamped.hi);
                if fmt.bytes_per_sample == 1 {
                    let packed8 = self.b.ins().unarrow(packed16, packed16);
                    let cast = Self::vec_flags();
                    let as_i64x2 = self.b.ins().bitcast(types::I64X2, cast, packed8);
                    let low64 = self.b.ins().extractlane(as_i64x2, 0);
                    self.b.ins().store(flags, low64, addr, 0);
                } else {
                    self.b.ins().store(flags, packed16, addr, 0);
                }
            }
            SampleType::Float => {
                let h = self.ensure_float(res.vec);
                self.b.ins().store(flags, h.lo, addr, 0);
                self.b.ins().store(flags, h.hi, addr, 16);
            }
        }
    }

    /// Walks the opcode sequence once, emitting one batch of the program and
    /// its store. The symbolic stack lives only inside this call.
    fn build_one_iter(
        &mut self,
        state: &KernelState,
        expr: &str,
        tokens: &[&str],
        ops: &[Op],
    ) -> Result<(), CompileError> {
        let mut stack: Vec<StackValue> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            let tok = tokens[i];
            if stack.len() < op.arity() {
                return Err(CompileError::StackUnderflow(tok.to_string()));
            }

            match op {
                Op::Dup { depth } => {
                    let depth = *depth as usize;
                    if depth >= stack.len() {
                        return Err(CompileError::StackUnderflow(tok.to_string()));
                    }
                    let copied = stack[stack.len() - 1 - depth];
                    stack.push(copied);
                }
                Op::Swap { depth } => {
                    let depth = *depth as usize;
                    if depth >= stack.len() {
                        return Err(CompileError::StackUnderflow(tok.to_string()));
                    }
                    let top = stack.len() - 1;
                    stack.swap(top, top - depth);
                }
                Op::MemLoad { clip } => {
                    if *clip >= self.inputs.len() {
                        return Err(CompileError::UndefinedClip(tok.to_string()));
                    }
                    let loaded = self.emit_mem_load(state, *clip);
                    stack.push(loaded);
                }
                Op::Constant { value } => {
                    let v = *value;
                    if v == (v as i32) as f32 {
                        let h = self.splat_ic(v as i32);
                        stack.push(StackValue {
                            vec: Vec8::Int(h),
                            literal: Some(Literal::Int(v as i32)),
                        });
                    } else {
                        let h = self.splat_fc(v);
                        stack.push(StackValue {
                            vec: Vec8::Float(h),
                            literal: Some(Literal::Float(v)),
                        });
                    }
                }
                Op::LoadConst { which } => match which {
                    ConstLoad::N => {
                        let n = self
                            .b
                            .ins()
                            .load(types::I32, MemFlags::new(), state.consts, 0);
                        let h = self.splat_int_scalar(n);
                        self.push_int_result(&mut stack, h);
                    }
                    ConstLoad::X => {
                        let x = self.b.use_var(state.x);
                        let base = self.splat_int_scalar(x);
                        let h = self.iadd2(state.xvec, base);
                        self.push_int_result(&mut stack, h);
                    }
                    ConstLoad::Y => {
                        let y = self.b.use_var(state.y);
                        let h = self.splat_int_scalar(y);
                        self.push_int_result(&mut stack, h);
                    }
                    ConstLoad::PropSlot { id } => {
                        let offset = (4 * (1 + id)) as i32;
                        let v = self
                            .b
                            .ins()
                            .load(types::F32, MemFlags::new(), state.consts, offset);
                        let h = self.splat_float_scalar(v);
                        stack.push(StackValue::of(Vec8::Float(h)));
                    }
                    ConstLoad::Prop { .. } => {
                        unreachable!("property loads are rewritten to slots before code generation")
                    }
                },
                Op::Add | Op::Sub | Op::Mul | Op::Max | Op::Min => {
                    let r = stack.pop().expect("arity checked");
                    let l = stack.pop().expect("arity checked");
                    let float_domain = matches!(l.vec, Vec8::Float(_))
                        || matches!(r.vec, Vec8::Float(_))
                        || self.force_float;
                    let vec = if float_domain {
                        let lf = self.ensure_float(l.vec);
                        let rf = self.ensure_float(r.vec);
                        Vec8::Float(match op {
                            Op::Add => self.fadd2(lf, rf),
                            Op::Sub => self.fsub2(lf, rf),
                            Op::Mul => self.fmul2(lf, rf),
                            Op::Max => self.fmax2(lf, rf),
                            _ => self.fmin2(lf, rf),
                        })
                    } else {
                        let (Vec8::Int(li), Vec8::Int(ri)) = (l.vec, r.vec) else {
                            unreachable!("float operands take the float path");
                        };
                        Vec8::Int(match op {
                            Op::Add => self.iadd2(li, ri),
                            Op::Sub => self.isub2(li, ri),
                            Op::Mul => self.imul2(li, ri),
                            Op::Max => self.smax2(li, ri),
                            _ => self.smin2(li, ri),
                        })
                    };
                    stack.push(StackValue::of(vec));
                }
                Op::Div | Op::Mod => {
                    let r = stack.pop().expect("arity checked");
                    let l = stack.pop().expect("arity checked");
                    let lf = self.ensure_float(l.vec);
                    let rf = self.ensure_float(r.vec);
                    let h = if matches!(op, Op::Div) {
                        self.fdiv2(lf, rf)
                    } else {
                        // a - trunc(a/b) * b
                        let q = self.fdiv2(lf, rf);
                        let qt = self.trunc2(q);
                        let whole = self.fmul2(qt, rf);
                        self.fsub2(lf, whole)
                    };
                    stack.push(StackValue::of(Vec8::Float(h)));
                }
                Op::Sqrt => {
                    let v = stack.pop().expect("arity checked");
                    let x = self.ensure_float(v.vec);
                    let zero = self.splat_fc(0.0);
                    let nonneg = self.fmax2(x, zero);
                    let h = self.sqrt2(nonneg);
                    stack.push(StackValue::of(Vec8::Float(h)));
                }
                Op::Abs => {
                    let v = stack.pop().expect("arity checked");
                    match v.vec {
                        Vec8::Float(h) => {
                            let r = self.fabs2(h);
                            stack.push(StackValue::of(Vec8::Float(r)));
                        }
                        Vec8::Int(h) if self.force_float => {
                            let f = self.int_to_float2(h);
                            let r = self.fabs2(f);
                            stack.push(StackValue::of(Vec8::Float(r)));
                        }
                        Vec8::Int(h) => {
                            let r = self.iabs2(h);
                            stack.push(StackValue::of(Vec8::Int(r)));
                        }
                    }
                }
                Op::Trunc | Op::Round | Op::Floor => {
                    let v = stack.pop().expect("arity checked");
                    let x = self.ensure_float(v.vec);
                    let h = match op {
                        Op::Trunc => self.trunc2(x),
                        Op::Round => self.nearest2(x),
                        _ => self.floor2(x),
                    };
                    stack.push(StackValue::of(Vec8::Float(h)));
                }
                Op::Cmp { kind } => {
                    let r = stack.pop().expect("arity checked");
                    let l = stack.pop().expect("arity checked");
                    let mask = match (l.vec, r.vec) {
                        (Vec8::Int(li), Vec8::Int(ri)) => self.icmp2(int_cc(*kind), li, ri),
                        _ => {
                            let lf = self.ensure_float(l.vec);
                            let rf = self.ensure_float(r.vec);
                            self.fcmp2(float_cc(*kind), lf, rf)
                        }
                    };
                    let one = self.splat_ic(1);
                    let bit = self.band2(mask, one);
                    self.push_int_result(&mut stack, bit);
                }
                Op::And | Op::Or | Op::Xor => {
                    let r = stack.pop().expect("arity checked");
                    let l = stack.pop().expect("arity checked");
                    let lm = self.truth_mask(l.vec);
                    let rm = self.truth_mask(r.vec);
                    let combined = match op {
                        Op::And => self.band2(lm, rm),
                        Op::Or => self.bor2(lm, rm),
                        _ => self.bxor2(lm, rm),
                    };
                    let one = self.splat_ic(1);
                    let bit = self.band2(combined, one);
                    self.push_int_result(&mut stack, bit);
                }
                Op::Not => {
                    let v = stack.pop().expect("arity checked");
                    let mask = match v.vec {
                        Vec8::Float(h) => {
                            let zero = self.splat_fc(0.0);
                            self.fcmp2(FloatCC::LessThanOrEqual, h, zero)
                        }
                        Vec8::Int(h) => {
                            let zero = self.splat_ic(0);
                            self.icmp2(IntCC::SignedLessThanOrEqual, h, zero)
                        }
                    };
                    let one = self.splat_ic(1);
                    let bit = self.band2(mask, one);
                    self.push_int_result(&mut stack, bit);
                }
                Op::Exp | Op::Log | Op::Sin | Op::Cos => {
                    let v = stack.pop().expect("arity checked");
                    let x = self.ensure_float(v.vec);
                    let id = match op {
                        Op::Exp => self.helpers.exp,
                        Op::Log => self.helpers.log,
                        Op::Sin => self.helpers.sin,
                        _ => self.helpers.cos,
                    };
                    let h = self.call_unary(id, x);
                    stack.push(StackValue::of(Vec8::Float(h)));
                }
                Op::Pow => {
                    let r = stack.pop().expect("arity checked");
                    let l = stack.pop().expect("arity checked");
                    let base = self.ensure_float(l.vec);
                    let h = match (r.vec, r.literal) {
                        (Vec8::Int(_), Some(Literal::Int(n))) => self.emit_powi(base, n),
                        _ => {
                            let exponent = self.ensure_float(r.vec);
                            self.call_binary(self.helpers.pow, base, exponent)
                        }
                    };
                    stack.push(StackValue::of(Vec8::Float(h)));
                }
                Op::Ternary => {
                    let f = stack.pop().expect("arity checked");
                    let t = stack.pop().expect("arity checked");
                    let c = stack.pop().expect("arity checked");
                    let mask = self.truth_mask(c.vec);
                    let inv = self.bnot2(mask);
                    if matches!(t.vec, Vec8::Float(_)) || matches!(f.vec, Vec8::Float(_)) {
                        let tf = self.ensure_float(t.vec);
                        let ff = self.ensure_float(f.vec);
                        let tb = self.bits_of2(tf);
                        let fb = self.bits_of2(ff);
                        let then_bits = self.band2(tb, mask);
                        let else_bits = self.band2(fb, inv);
                        let sel = self.bor2(then_bits, else_bits);
                        let h = self.float_of_bits2(sel);
                        stack.push(StackValue::of(Vec8::Float(h)));
                    } else {
                        let (Vec8::Int(ti), Vec8::Int(fi)) = (t.vec, f.vec) else {
                            unreachable!("float branches take the bit-pattern path");
                        };
                        let then_bits = self.band2(ti, mask);
                        let else_bits = self.band2(fi, inv);
                        let sel = self.bor2(then_bits, else_bits);
                        self.push_int_result(&mut stack, sel);
                    }
                }
            }
        }

        if stack.is_empty() {
            return Err(CompileError::EmptyExpression(expr.to_string()));
        }
        if stack.len() > 1 {
            return Err(CompileError::UnconsumedValues(expr.to_string()));
        }
        let result = stack.pop().expect("length checked");
        self.emit_store(state, result);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn build_kernel(
    module: &mut JITModule,
    helpers: &Helpers,
    expr: &str,
    tokens: &[&str],
    ops: &[Op],
    out: &PixelFormat,
    inputs: &[PixelFormat],
    force_float: bool,
) -> Result<FuncId, ExprError> {
    let ptr_type = module.target_config().pointer_type();
    let ptr_bytes = ptr_type.bytes() as i32;

    let mut ctx = module.make_context();
    ctx.func.signature.params.push(AbiParam::new(ptr_type));
    ctx.func.signature.params.push(AbiParam::new(ptr_type));
    ctx.func.signature.params.push(AbiParam::new(ptr_type));
    ctx.func.signature.params.push(AbiParam::new(types::I32));
    ctx.func.signature.params.push(AbiParam::new(types::I32));

    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);

        let rwptrs = b.block_params(entry)[0];
        let strides_ptr = b.block_params(entry)[1];
        let consts = b.block_params(entry)[2];
        let width = b.block_params(entry)[3];
        let height = b.block_params(entry)[4];

        let mut wptrs = Vec::with_capacity(inputs.len() + 1);
        let mut strides = Vec::with_capacity(inputs.len() + 1);
        for i in 0..=inputs.len() {
            let i = i as i32;
            wptrs.push(b.ins().load(ptr_type, MemFlags::new(), rwptrs, i * ptr_bytes));
            strides.push(b.ins().load(types::I32, MemFlags::new(), strides_ptr, i * 4));
        }

        // Lane offsets [0..LANES), materialized once per call.
        let zero = b.ins().iconst(types::I32, 0);
        let mut xvec_lo = b.ins().splat(types::I32X4, zero);
        let mut xvec_hi = b.ins().splat(types::I32X4, zero);
        for lane in 0..4u8 {
            let c = b.ins().iconst(types::I32, lane as i64);
            xvec_lo = b.ins().insertlane(xvec_lo, c, lane);
            let c = b.ins().iconst(types::I32, lane as i64 + 4);
            xvec_hi = b.ins().insertlane(xvec_hi, c, lane);
        }

        let y_var = Variable::new(0);
        let x_var = Variable::new(1);
        b.declare_var(y_var, types::I32);
        b.declare_var(x_var, types::I32);
        let zero = b.ins().iconst(types::I32, 0);
        b.def_var(y_var, zero);
        b.def_var(x_var, zero);

        let y_header = b.create_block();
        let y_body = b.create_block();
        let x_header = b.create_block();
        let x_body = b.create_block();
        let y_inc = b.create_block();
        let exit = b.create_block();

        b.ins().jump(y_header, &[]);

        b.switch_to_block(y_header);
        let y = b.use_var(y_var);
        let more_rows = b.ins().icmp(IntCC::SignedLessThan, y, height);
        b.ins().brif(more_rows, y_body, &[], exit, &[]);

        b.switch_to_block(y_body);
        b.seal_block(y_body);
        let zero = b.ins().iconst(types::I32, 0);
        b.def_var(x_var, zero);
        b.ins().jump(x_header, &[]);

        b.switch_to_block(x_header);
        let x = b.use_var(x_var);
        let more_cols = b.ins().icmp(IntCC::SignedLessThan, x, width);
        b.ins().brif(more_cols, x_body, &[], y_inc, &[]);

        b.switch_to_block(x_body);
        b.seal_block(x_body);
        let state = KernelState {
            wptrs,
            strides,
            consts,
            xvec: Half2 {
                lo: xvec_lo,
                hi: xvec_hi,
            },
            x: x_var,
            y: y_var,
        };
        {
            let mut plane = PlaneCompiler {
                b: &mut b,
                module: &mut *module,
                helpers,
                out: *out,
                inputs,
                force_float,
                ptr_type,
            };
            for _ in 0..UNROLL {
                plane.build_one_iter(&state, expr, tokens, ops)?;
            }
        }
        let x = b.use_var(x_var);
        let next_x = b.ins().iadd_imm(x, (LANES * UNROLL) as i64);
        b.def_var(x_var, next_x);
        b.ins().jump(x_header, &[]);
        b.seal_block(x_header);

        b.switch_to_block(y_inc);
        b.seal_block(y_inc);
        let y = b.use_var(y_var);
        let next_y = b.ins().iadd_imm(y, 1);
        b.def_var(y_var, next_y);
        b.ins().jump(y_header, &[]);
        b.seal_block(y_header);

        b.switch_to_block(exit);
        b.seal_block(exit);
        b.ins().return_(&[]);
        b.finalize();
    }

    let id = module
        .declare_function("proc_plane", Linkage::Export, &ctx.func.signature)
        .map_err(JitError::from)?;
    module
        .define_function(id, &mut ctx)
        .map_err(JitError::from)?;
    module.clear_context(&mut ctx);
    Ok(id)
}
