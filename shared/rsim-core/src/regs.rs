//! GPU registers consumed by the rasterizer boxes.
//!
//! Register writes arrive as `(GpuRegister, subregister, GpuRegData)`.
//! The enums encode to the same small integers the Command Processor uses
//! on the wire, so `from_bits`/`bits` round-trip.

use serde::{Deserialize, Serialize};

/// Unknown encoding for a field enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownVariant<T>(pub T);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuRegister {
    /// Display resolution; subreg 0 = width, 1 = height.
    Resolution,
    /// Viewport; subreg 0 = x, 1 = y, 2 = width, 3 = height.
    Viewport,
    ScissorTest,
    /// Scissor box; subreg 0 = x, 1 = y, 2 = width, 3 = height.
    Scissor,
    Culling,
    FaceMode,
    TwoSidedLighting,
    DepthPrecision,
    MultisamplingEnable,
    MsaaSamples,
    HierarchicalZ,
    EarlyZ,
    ModifyFragmentDepth,
    DepthTest,
    DepthFunction,
    DepthMask,
    ZBufferClear,
    StencilTest,
    StencilFunction,
    StencilReference,
    StencilTestMask,
    StencilUpdateMask,
    StencilFail,
    DepthFail,
    DepthPass,
    StencilBufferClear,
    /// Fragment shader input attribute enable; subreg = attribute slot.
    FragmentInputAttributes,
    /// Attribute interpolation enable (flat when false); subreg = slot.
    Interpolation,
    /// Render target write enable; subreg = target.
    RenderTargetEnable,
}

/// Register payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpuRegData {
    Uint(u32),
    Int(i32),
    Float(f32),
    Bool(bool),
    Vec4([f32; 4]),
    Compare(CompareFunction),
    Cull(CullMode),
    Face(FaceMode),
    Stencil(StencilUpdate),
}

impl GpuRegData {
    /// Payload as an unsigned integer. Panics on a payload of another kind,
    /// which means the register write was built for a different register.
    pub fn as_uint(&self) -> u32 {
        match *self {
            Self::Uint(v) => v,
            Self::Int(v) => v as u32,
            other => panic!("register payload {other:?} is not an integer"),
        }
    }

    pub fn as_int(&self) -> i32 {
        match *self {
            Self::Int(v) => v,
            Self::Uint(v) => v as i32,
            other => panic!("register payload {other:?} is not an integer"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(v) => v,
            Self::Uint(v) => v != 0,
            other => panic!("register payload {other:?} is not a boolean"),
        }
    }

    pub fn as_compare(&self) -> CompareFunction {
        match *self {
            Self::Compare(c) => c,
            other => panic!("register payload {other:?} is not a compare function"),
        }
    }

    pub fn as_cull(&self) -> CullMode {
        match *self {
            Self::Cull(c) => c,
            other => panic!("register payload {other:?} is not a cull mode"),
        }
    }

    pub fn as_face(&self) -> FaceMode {
        match *self {
            Self::Face(f) => f,
            other => panic!("register payload {other:?} is not a face mode"),
        }
    }

    pub fn as_stencil_update(&self) -> StencilUpdate {
        match *self {
            Self::Stencil(s) => s,
            other => panic!("register payload {other:?} is not a stencil update function"),
        }
    }
}

/// Depth and stencil compare function.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareFunction {
    Never = 0,
    Always = 1,
    Less = 2,
    Lequal = 3,
    Equal = 4,
    Gequal = 5,
    Greater = 6,
    Notequal = 7,
}

impl CompareFunction {
    pub const fn from_bits(bits: u8) -> Result<Self, UnknownVariant<u8>> {
        match bits {
            0 => Ok(Self::Never),
            1 => Ok(Self::Always),
            2 => Ok(Self::Less),
            3 => Ok(Self::Lequal),
            4 => Ok(Self::Equal),
            5 => Ok(Self::Gequal),
            6 => Ok(Self::Greater),
            7 => Ok(Self::Notequal),
            bits => Err(UnknownVariant(bits)),
        }
    }

    #[must_use]
    pub const fn bits(&self) -> u8 {
        *self as u8
    }

    /// `incoming FUNC stored`.
    pub fn test(self, incoming: u32, stored: u32) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Less => incoming < stored,
            Self::Lequal => incoming <= stored,
            Self::Equal => incoming == stored,
            Self::Gequal => incoming >= stored,
            Self::Greater => incoming > stored,
            Self::Notequal => incoming != stored,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CullMode {
    None = 0,
    Front = 1,
    Back = 2,
    FrontAndBack = 3,
}

impl CullMode {
    pub const fn from_bits(bits: u8) -> Result<Self, UnknownVariant<u8>> {
        match bits {
            0 => Ok(Self::None),
            1 => Ok(Self::Front),
            2 => Ok(Self::Back),
            3 => Ok(Self::FrontAndBack),
            bits => Err(UnknownVariant(bits)),
        }
    }

    #[must_use]
    pub const fn bits(&self) -> u8 {
        *self as u8
    }
}

/// Winding of front-facing triangles.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceMode {
    Cw = 0,
    Ccw = 1,
}

impl FaceMode {
    pub const fn from_bits(bits: u8) -> Result<Self, UnknownVariant<u8>> {
        match bits {
            0 => Ok(Self::Cw),
            1 => Ok(Self::Ccw),
            bits => Err(UnknownVariant(bits)),
        }
    }

    #[must_use]
    pub const fn bits(&self) -> u8 {
        *self as u8
    }
}

/// Stencil buffer update operation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StencilUpdate {
    Keep = 0,
    Zero = 1,
    Replace = 2,
    Incr = 3,
    Decr = 4,
    Invert = 5,
    IncrWrap = 6,
    DecrWrap = 7,
}

impl StencilUpdate {
    pub const fn from_bits(bits: u8) -> Result<Self, UnknownVariant<u8>> {
        match bits {
            0 => Ok(Self::Keep),
            1 => Ok(Self::Zero),
            2 => Ok(Self::Replace),
            3 => Ok(Self::Incr),
            4 => Ok(Self::Decr),
            5 => Ok(Self::Invert),
            6 => Ok(Self::IncrWrap),
            7 => Ok(Self::DecrWrap),
            bits => Err(UnknownVariant(bits)),
        }
    }

    #[must_use]
    pub const fn bits(&self) -> u8 {
        *self as u8
    }

    /// New stencil value for `current` given the reference value.
    pub fn apply(self, current: u8, reference: u8) -> u8 {
        match self {
            Self::Keep => current,
            Self::Zero => 0,
            Self::Replace => reference,
            Self::Incr => current.saturating_add(1),
            Self::Decr => current.saturating_sub(1),
            Self::Invert => !current,
            Self::IncrWrap => current.wrapping_add(1),
            Self::DecrWrap => current.wrapping_sub(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_bits_round_trip() {
        for bits in 0..8u8 {
            let f = CompareFunction::from_bits(bits).unwrap();
            assert_eq!(f.bits(), bits);
        }
        assert_eq!(CompareFunction::from_bits(8), Err(UnknownVariant(8)));
    }

    #[test]
    fn compare_orientation_is_incoming_versus_stored() {
        assert!(CompareFunction::Less.test(1, 2));
        assert!(!CompareFunction::Less.test(2, 2));
        assert!(CompareFunction::Gequal.test(2, 2));
        assert!(!CompareFunction::Never.test(0, 0));
    }

    #[test]
    fn stencil_saturation_and_wrap() {
        assert_eq!(StencilUpdate::Incr.apply(255, 0), 255);
        assert_eq!(StencilUpdate::IncrWrap.apply(255, 0), 0);
        assert_eq!(StencilUpdate::Decr.apply(0, 0), 0);
        assert_eq!(StencilUpdate::DecrWrap.apply(0, 0), 255);
        assert_eq!(StencilUpdate::Replace.apply(3, 9), 9);
        assert_eq!(StencilUpdate::Invert.apply(0x0f, 0), 0xf0);
    }

    #[test]
    #[should_panic(expected = "not a compare function")]
    fn wrong_payload_kind_panics() {
        GpuRegData::Uint(1).as_compare();
    }
}
