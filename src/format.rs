/// Sample representation of one pixel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFamily {
    Gray,
    Yuv,
    Rgb,
    /// Legacy packed formats. Never processable; rejected when an output
    /// format override is requested.
    Compat,
}

/// Constant per-clip pixel format.
///
/// Integer formats carry 8-16 bits in 1 or 2 bytes per sample; the only
/// supported float format is 32-bit. 16-bit float is representable here so
/// construction can reject it with a proper error instead of trapping later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub sample_type: SampleType,
    pub bits_per_sample: u32,
    pub bytes_per_sample: u32,
    pub color_family: ColorFamily,
    pub sub_sampling_w: u32,
    pub sub_sampling_h: u32,
    pub num_planes: usize,
}

impl PixelFormat {
    pub fn new(
        sample_type: SampleType,
        bits_per_sample: u32,
        color_family: ColorFamily,
        sub_sampling_w: u32,
        sub_sampling_h: u32,
        num_planes: usize,
    ) -> Self {
        let bytes_per_sample = match sample_type {
            SampleType::Integer => {
                if bits_per_sample <= 8 {
                    1
                } else {
                    2
                }
            }
            SampleType::Float => {
                if bits_per_sample == 16 {
                    2
                } else {
                    4
                }
            }
        };
        PixelFormat {
            sample_type,
            bits_per_sample,
            bytes_per_sample,
            color_family,
            sub_sampling_w,
            sub_sampling_h,
            num_planes,
        }
    }

    /// Single-plane integer format, handy for tests and tools.
    pub fn gray_int(bits_per_sample: u32) -> Self {
        PixelFormat::new(SampleType::Integer, bits_per_sample, ColorFamily::Gray, 0, 0, 1)
    }

    /// Single-plane 32-bit float format.
    pub fn gray_float() -> Self {
        PixelFormat::new(SampleType::Float, 32, ColorFamily::Gray, 0, 0, 1)
    }

    /// 4:2:0 integer YUV, three planes.
    pub fn yuv420_int(bits_per_sample: u32) -> Self {
        PixelFormat::new(SampleType::Integer, bits_per_sample, ColorFamily::Yuv, 1, 1, 3)
    }

    /// The output format obtained by keeping this format's family and
    /// subsampling while taking the sample type and depth of a preset.
    pub fn with_sample(self, sample_type: SampleType, bits_per_sample: u32) -> Self {
        PixelFormat::new(
            sample_type,
            bits_per_sample,
            self.color_family,
            self.sub_sampling_w,
            self.sub_sampling_h,
            self.num_planes,
        )
    }

    /// Whether the compiler can read or write this format: 8-16 bit integer
    /// or 32-bit float. Half precision is deliberately not supported.
    pub fn is_supported(&self) -> bool {
        match self.sample_type {
            SampleType::Integer => (8..=16).contains(&self.bits_per_sample),
            SampleType::Float => self.bits_per_sample == 32,
        }
    }
}

/// What a filter knows about one input clip ahead of any frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipInfo {
    /// `None` models a variable-format clip, which the filter rejects.
    pub format: Option<PixelFormat>,
    pub width: i32,
    pub height: i32,
}

impl ClipInfo {
    pub fn new(format: PixelFormat, width: i32, height: i32) -> Self {
        ClipInfo {
            format: Some(format),
            width,
            height,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.format.is_some() && self.width > 0 && self.height > 0
    }
}
