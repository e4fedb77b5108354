//! Filter-construction surface and per-frame scalar assembly.
//!
//! This is the boundary a host plugs into: it validates the clip set and
//! expression list once, compiles one kernel per processed plane, and at
//! frame time gathers the scalar-constants buffer and dispatches each plane
//! as process, copy or leave-undefined.

use crate::format::{ClipInfo, ColorFamily, PixelFormat};
use crate::jit::{compile_plane, CompiledPlane, Tuning, FLAG_USE_INTEGER};
use crate::op::PropAccess;
use crate::ExprError;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Hard cap on input clips; clip letters only reach `a`..`z`.
pub const MAX_INPUTS: usize = 26;

/// Minimum buffer alignment the host guarantees for every plane. The
/// generated loads and stores tolerate less, but hosts honoring this keep
/// them on their fast path.
pub const ALIGNMENT: usize = 32;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("At least one input clip is required")]
    NoClips,
    #[error("More than 26 input clips provided")]
    TooManyClips,
    #[error("Only clips with constant format and dimensions allowed")]
    VariableClip,
    #[error("All inputs must have the same number of planes and the same dimensions, subsampling included")]
    MismatchedClips,
    #[error("Input clips must be 8-16 bit integer or 32 bit float format")]
    UnsupportedFormat,
    #[error("No compat formats allowed")]
    CompatFormat,
    #[error("The number of planes in the inputs and output must match")]
    PlaneCountMismatch,
    #[error("More expressions given than there are planes")]
    TooManyExpressions,
}

/// A frame property as a host exposes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropValue {
    Int(i64),
    Float(f64),
}

/// Per-frame property lookup the host implements over its frame metadata.
pub trait FrameProps {
    fn prop(&self, clip: usize, name: &str) -> Option<PropValue>;
}

/// Property source with no properties; every lookup misses.
pub struct NoProps;

impl FrameProps for NoProps {
    fn prop(&self, _clip: usize, _name: &str) -> Option<PropValue> {
        None
    }
}

impl FrameProps for HashMap<(usize, String), PropValue> {
    fn prop(&self, clip: usize, name: &str) -> Option<PropValue> {
        self.get(&(clip, name.to_string())).copied()
    }
}

/// Builds the scalar-constants buffer for one frame: slot 0 carries the
/// frame number as an `i32` bit pattern, then one float per property table
/// entry. A missing property becomes a quiet NaN; the kernel has no separate
/// signaling path.
pub fn gather_consts(n: i32, prop_access: &[PropAccess], props: &dyn FrameProps) -> Vec<f32> {
    let mut consts = Vec::with_capacity(1 + prop_access.len());
    consts.push(f32::from_bits(n as u32));
    for pa in prop_access {
        let value = match props.prop(pa.clip, &pa.name) {
            Some(PropValue::Int(i)) => i as f32,
            Some(PropValue::Float(f)) => f as f32,
            None => f32::NAN,
        };
        consts.push(value);
    }
    consts
}

/// How one output plane is produced per frame.
#[derive(Debug, Clone)]
pub enum PlaneMode {
    /// Run the compiled kernel. Shared so filter clones reuse one module.
    Process(Arc<CompiledPlane>),
    /// Bit-copy the plane from clip 0.
    Copy,
    /// The host leaves the plane contents undefined.
    Undefined,
}

/// Construction-time inputs, mirroring the host's argument list.
pub struct FilterParams<'a> {
    pub clips: &'a [ClipInfo],
    pub exprs: &'a [&'a str],
    /// Optional output preset; only sample type and bit depth may differ
    /// from clip 0.
    pub format: Option<PixelFormat>,
    pub opt: u32,
    pub tuning: Tuning,
}

impl<'a> FilterParams<'a> {
    pub fn new(clips: &'a [ClipInfo], exprs: &'a [&'a str]) -> Self {
        FilterParams {
            clips,
            exprs,
            format: None,
            opt: FLAG_USE_INTEGER,
            tuning: Tuning::default(),
        }
    }
}

/// A validated, fully compiled filter instance.
#[derive(Debug)]
pub struct ExprFilter {
    out_format: PixelFormat,
    width: i32,
    height: i32,
    num_inputs: usize,
    planes: Vec<PlaneMode>,
}

impl ExprFilter {
    pub fn new(params: &FilterParams) -> Result<Self, ExprError> {
        let clips = params.clips;
        if clips.is_empty() {
            return Err(FilterError::NoClips.into());
        }
        if clips.len() > MAX_INPUTS {
            return Err(FilterError::TooManyClips.into());
        }

        let mut in_formats = Vec::with_capacity(clips.len());
        for clip in clips {
            match clip.format {
                Some(fmt) if clip.is_constant() => in_formats.push(fmt),
                _ => return Err(FilterError::VariableClip.into()),
            }
        }

        let first = &clips[0];
        let first_fmt = in_formats[0];
        for (clip, fmt) in clips.iter().zip(&in_formats) {
            if fmt.num_planes != first_fmt.num_planes
                || fmt.sub_sampling_w != first_fmt.sub_sampling_w
                || fmt.sub_sampling_h != first_fmt.sub_sampling_h
                || clip.width != first.width
                || clip.height != first.height
            {
                return Err(FilterError::MismatchedClips.into());
            }
            if !fmt.is_supported() {
                return Err(FilterError::UnsupportedFormat.into());
            }
        }

        let out_format = match &params.format {
            Some(preset) => {
                if first_fmt.color_family == ColorFamily::Compat {
                    return Err(FilterError::CompatFormat.into());
                }
                if first_fmt.num_planes != preset.num_planes {
                    return Err(FilterError::PlaneCountMismatch.into());
                }
                first_fmt.with_sample(preset.sample_type, preset.bits_per_sample)
            }
            None => first_fmt,
        };
        if !out_format.is_supported() {
            return Err(FilterError::UnsupportedFormat.into());
        }

        let num_planes = out_format.num_planes;
        if params.exprs.len() > num_planes {
            return Err(FilterError::TooManyExpressions.into());
        }

        // Planes past the given expressions reuse the last one.
        let mut exprs: Vec<&str> = params.exprs.to_vec();
        let last = exprs.last().copied().unwrap_or("");
        exprs.resize(num_planes, last);

        let mut planes = Vec::with_capacity(num_planes);
        for expr in &exprs {
            if expr.is_empty() {
                if out_format.bits_per_sample == first_fmt.bits_per_sample
                    && out_format.sample_type == first_fmt.sample_type
                {
                    planes.push(PlaneMode::Copy);
                } else {
                    planes.push(PlaneMode::Undefined);
                }
                continue;
            }
            let compiled = compile_plane(expr, &out_format, &in_formats, params.opt, &params.tuning)?;
            planes.push(PlaneMode::Process(Arc::new(compiled)));
        }

        Ok(ExprFilter {
            out_format,
            width: first.width,
            height: first.height,
            num_inputs: clips.len(),
            planes,
        })
    }

    pub fn output_format(&self) -> &PixelFormat {
        &self.out_format
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane_mode(&self, plane: usize) -> &PlaneMode {
        &self.planes[plane]
    }

    /// Dimensions of one plane after chroma subsampling.
    pub fn plane_dimensions(&self, plane: usize) -> (i32, i32) {
        if plane == 0 {
            (self.width, self.height)
        } else {
            (
                self.width >> self.out_format.sub_sampling_w,
                self.height >> self.out_format.sub_sampling_h,
            )
        }
    }

    /// Produces one output plane of frame `n`: runs the kernel, copies from
    /// clip 0, or leaves the buffer untouched, per the plane's mode.
    pub fn process_plane(
        &self,
        plane: usize,
        n: i32,
        dst: &mut [u8],
        dst_stride: i32,
        srcs: &[(&[u8], i32)],
        props: &dyn FrameProps,
    ) {
        let (width, height) = self.plane_dimensions(plane);
        match &self.planes[plane] {
            PlaneMode::Process(compiled) => {
                let consts = gather_consts(n, compiled.prop_access(), props);
                compiled.run(dst, dst_stride, srcs, &consts, width, height);
            }
            PlaneMode::Copy => {
                let row = width as usize * self.out_format.bytes_per_sample as usize;
                let (src, src_stride) = srcs[0];
                for y in 0..height as usize {
                    let d = y * dst_stride as usize;
                    let s = y * src_stride as usize;
                    dst[d..d + row].copy_from_slice(&src[s..s + row]);
                }
            }
            PlaneMode::Undefined => {}
        }
    }
}
