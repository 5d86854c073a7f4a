use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid type tag {0}")]
    InvalidType(i64),
    #[error("invalid IEEE-754 bit string `{0}`")]
    InvalidBitString(String),
}

/// C scalar type tags as emitted by the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum CType {
    Boolean = -1,
    UChar = 0,
    Char = 1,
    UShort = 2,
    Short = 3,
    UInt = 4,
    Int = 5,
    ULong = 6,
    Long = 7,
    ULongLong = 8,
    LongLong = 9,
    Struct = 10,
    Pointer = 11,
    Float = 12,
    Double = 13,
    LongDouble = 14,
    BitfieldChar = 15,
    BitfieldUnionShort = 16,
    BitfieldUnionInt = 17,
    BitfieldUnionLongLong = 18,
}

impl CType {
    pub fn from_tag(tag: i64) -> Result<Self, Error> {
        Ok(match tag {
            -1 => Self::Boolean,
            0 => Self::UChar,
            1 => Self::Char,
            2 => Self::UShort,
            3 => Self::Short,
            4 => Self::UInt,
            5 => Self::Int,
            6 => Self::ULong,
            7 => Self::Long,
            8 => Self::ULongLong,
            9 => Self::LongLong,
            10 => Self::Struct,
            11 => Self::Pointer,
            12 => Self::Float,
            13 => Self::Double,
            14 => Self::LongDouble,
            15 => Self::BitfieldChar,
            16 => Self::BitfieldUnionShort,
            17 => Self::BitfieldUnionInt,
            18 => Self::BitfieldUnionLongLong,
            _ => return Err(Error::InvalidType(tag)),
        })
    }

    pub fn tag(self) -> i8 {
        self as i8
    }

    /// Size in bytes; aggregates report zero.
    pub fn size(self) -> usize {
        match self {
            Self::Boolean | Self::UChar | Self::Char | Self::BitfieldChar => 1,
            Self::UShort | Self::Short | Self::BitfieldUnionShort => 2,
            Self::UInt | Self::Int | Self::Float | Self::BitfieldUnionInt => 4,
            Self::ULong
            | Self::Long
            | Self::ULongLong
            | Self::LongLong
            | Self::Pointer
            | Self::Double
            | Self::BitfieldUnionLongLong => 8,
            Self::LongDouble => 16,
            Self::Struct => 0,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Char | Self::Short | Self::Int | Self::Long | Self::LongLong
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn is_bitfield(self) -> bool {
        self.tag() >= Self::BitfieldChar.tag()
    }

    /// Integral types proper; floats, aggregates and bitfields excluded.
    pub fn is_integral(self) -> bool {
        self.tag() < Self::Struct.tag()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Boolean => "bool",
            Self::UChar => "unsigned char",
            Self::Char => "char",
            Self::UShort => "unsigned short",
            Self::Short => "short",
            Self::UInt => "unsigned int",
            Self::Int => "int",
            Self::ULong => "unsigned long",
            Self::Long => "long",
            Self::ULongLong => "unsigned long long",
            Self::LongLong => "long long",
            Self::Struct => "struct",
            Self::Pointer => "pointer",
            Self::Float => "float",
            Self::Double => "double",
            Self::LongDouble => "long double",
            Self::BitfieldChar => "bitfield char",
            Self::BitfieldUnionShort => "bitfield short",
            Self::BitfieldUnionInt => "bitfield int",
            Self::BitfieldUnionLongLong => "bitfield long long",
        }
    }

    /// Truncate (and sign-extend where applicable) a raw 64-bit pattern to
    /// the representable range of this type.
    pub fn cast_integral(self, raw: i64) -> i64 {
        match self {
            Self::Boolean => (raw != 0) as i64,
            Self::UChar | Self::BitfieldChar => raw as u8 as i64,
            Self::Char => raw as i8 as i64,
            Self::UShort | Self::BitfieldUnionShort => raw as u16 as i64,
            Self::Short => raw as i16 as i64,
            Self::UInt | Self::BitfieldUnionInt => raw as u32 as i64,
            Self::Int => raw as i32 as i64,
            _ => raw,
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A concrete value tagged with its originating C type.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    pub integral: i64,
    pub floating: f64,
    pub ty: CType,
}

impl Default for Value {
    fn default() -> Self {
        Self {
            integral: 0,
            floating: 0.0,
            ty: CType::Struct,
        }
    }
}

// floats compare by bit pattern so values can live inside hash-consed nodes
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.integral == other.integral
            && self.floating.to_bits() == other.floating.to_bits()
            && self.ty == other.ty
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.integral.hash(state);
        self.floating.to_bits().hash(state);
        self.ty.hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ty.is_float() {
            write!(f, "{}", self.floating)
        } else {
            write!(f, "{}", self.integral)
        }
    }
}

impl Value {
    pub fn new(integral: i64, floating: f64, ty: CType) -> Self {
        Self {
            integral,
            floating,
            ty,
        }
    }

    pub fn integral(integral: i64, ty: CType) -> Self {
        Self::new(integral, integral as f64, ty)
    }

    pub fn floating(floating: f64, ty: CType) -> Self {
        Self::new(floating as i64, floating, ty)
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }
}

/// Source location of an input declaration or a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub fname: String,
    pub lineno: i32,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            fname: String::new(),
            lineno: -1,
        }
    }
}

impl Location {
    pub fn new<S: Into<String>>(fname: S, lineno: i32) -> Self {
        Self {
            fname: fname.into(),
            lineno,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ Line: {}, File: {} ]", self.lineno, self.fname)
    }
}

fn bits_to_string(bits: u64, width: u32) -> String {
    (0..width)
        .rev()
        .map(|i| if (bits >> i) & 1 == 1 { '1' } else { '0' })
        .collect()
}

fn string_to_bits(s: &str, width: usize) -> Result<u64, Error> {
    let s = s.trim();
    if s.len() < width {
        return Err(Error::InvalidBitString(s.to_owned()));
    }

    s.bytes().take(width).try_fold(0u64, |acc, b| match b {
        b'0' => Ok(acc << 1),
        b'1' => Ok((acc << 1) | 1),
        _ => Err(Error::InvalidBitString(s.to_owned())),
    })
}

/// MSB-first `'0'`/`'1'` rendering of an `f32`.
pub fn float_to_bin_string(v: f32) -> String {
    bits_to_string(v.to_bits() as u64, 32)
}

pub fn double_to_bin_string(v: f64) -> String {
    bits_to_string(v.to_bits(), 64)
}

pub fn bin_string_to_float(s: &str) -> Result<f32, Error> {
    string_to_bits(s, 32).map(|bits| f32::from_bits(bits as u32))
}

pub fn bin_string_to_double(s: &str) -> Result<f64, Error> {
    string_to_bits(s, 64).map(f64::from_bits)
}

/// Rebuild an `f32` from its sign, biased exponent and significand without
/// the hidden bit.
pub fn set_float_by_ints(sign: bool, exp: i64, sig: u64) -> f32 {
    let bits = ((sign as u32) << 31) | ((exp as u32 & 0xff) << 23) | (sig as u32 & 0x7f_ffff);
    f32::from_bits(bits)
}

pub fn set_double_by_ints(sign: bool, exp: i64, sig: u64) -> f64 {
    let bits = ((sign as u64) << 63) | ((exp as u64 & 0x7ff) << 52) | (sig & 0xf_ffff_ffff_ffff);
    f64::from_bits(bits)
}
