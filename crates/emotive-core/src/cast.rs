//! Numeric type-cast stage applied to the classifier input.
//!
//! Converts an `f32` tensor to the element type a model declares for its
//! input. The shape never changes.

use half::f16;
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CastError {
    #[error("unknown numeric type: {0:?} (expected float16, float32, float64, int32, int64 or uint8)")]
    UnknownType(String),
    #[error("unsupported tensor element type: {0}")]
    UnsupportedElementType(String),
}

/// Element types the cast stage can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericType {
    Float16,
    Float32,
    Float64,
    Int32,
    Int64,
    Uint8,
}

impl NumericType {
    pub fn name(self) -> &'static str {
        match self {
            NumericType::Float16 => "float16",
            NumericType::Float32 => "float32",
            NumericType::Float64 => "float64",
            NumericType::Int32 => "int32",
            NumericType::Int64 => "int64",
            NumericType::Uint8 => "uint8",
        }
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for NumericType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for NumericType {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float16" | "f16" | "half" => Ok(NumericType::Float16),
            "float32" | "f32" | "float" => Ok(NumericType::Float32),
            "float64" | "f64" | "double" => Ok(NumericType::Float64),
            "int32" | "i32" => Ok(NumericType::Int32),
            "int64" | "i64" => Ok(NumericType::Int64),
            "uint8" | "u8" => Ok(NumericType::Uint8),
            _ => Err(CastError::UnknownType(s.to_string())),
        }
    }
}

/// Output of [`Cast::apply`], one variant per [`NumericType`].
#[derive(Debug, Clone, PartialEq)]
pub enum CastTensor {
    Float16(ArrayD<f16>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Uint8(ArrayD<u8>),
}

impl CastTensor {
    pub fn dtype(&self) -> NumericType {
        match self {
            CastTensor::Float16(_) => NumericType::Float16,
            CastTensor::Float32(_) => NumericType::Float32,
            CastTensor::Float64(_) => NumericType::Float64,
            CastTensor::Int32(_) => NumericType::Int32,
            CastTensor::Int64(_) => NumericType::Int64,
            CastTensor::Uint8(_) => NumericType::Uint8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            CastTensor::Float16(a) => a.shape(),
            CastTensor::Float32(a) => a.shape(),
            CastTensor::Float64(a) => a.shape(),
            CastTensor::Int32(a) => a.shape(),
            CastTensor::Int64(a) => a.shape(),
            CastTensor::Uint8(a) => a.shape(),
        }
    }
}

/// Casts its input to a fixed numeric type.
///
/// Integer targets round to nearest and saturate at the type bounds; NaN becomes 0.
/// Values too large for float16 become infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cast {
    target: NumericType,
}

impl Cast {
    pub fn new(target: NumericType) -> Self {
        Self { target }
    }

    pub fn target(&self) -> NumericType {
        self.target
    }

    pub fn apply<S, D>(&self, input: &ArrayBase<S, D>) -> CastTensor
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let view = input.view().into_dyn();
        match self.target {
            NumericType::Float16 => CastTensor::Float16(view.mapv(f16::from_f32)),
            NumericType::Float32 => CastTensor::Float32(view.to_owned()),
            NumericType::Float64 => CastTensor::Float64(view.mapv(|v| v as f64)),
            NumericType::Int32 => CastTensor::Int32(view.mapv(|v| v.round() as i32)),
            NumericType::Int64 => CastTensor::Int64(view.mapv(|v| v.round() as i64)),
            NumericType::Uint8 => CastTensor::Uint8(view.mapv(|v| v.round() as u8)),
        }
    }
}

impl Default for Cast {
    fn default() -> Self {
        Self::new(NumericType::Float32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array4};

    #[test]
    fn test_parse_names_and_aliases() {
        assert_eq!("float32".parse(), Ok(NumericType::Float32));
        assert_eq!("F64".parse(), Ok(NumericType::Float64));
        assert_eq!(" i32 ".parse(), Ok(NumericType::Int32));
        assert_eq!("uint8".parse(), Ok(NumericType::Uint8));
        assert_eq!("half".parse(), Ok(NumericType::Float16));
        assert!(matches!("bfloat16".parse::<NumericType>(), Err(CastError::UnknownType(_))));
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for t in [
            NumericType::Float16,
            NumericType::Float32,
            NumericType::Float64,
            NumericType::Int32,
            NumericType::Int64,
            NumericType::Uint8,
        ] {
            assert_eq!(t.to_string().parse::<NumericType>(), Ok(t));
        }
    }

    #[test]
    fn test_shape_preserved_for_every_target() {
        let input = Array4::<f32>::from_elem((1, 48, 48, 1), 0.5);
        for t in [
            NumericType::Float16,
            NumericType::Float32,
            NumericType::Float64,
            NumericType::Int32,
            NumericType::Uint8,
        ] {
            let out = Cast::new(t).apply(&input);
            assert_eq!(out.shape(), &[1, 48, 48, 1]);
            assert_eq!(out.dtype(), t);
        }
    }

    #[test]
    fn test_float_values_preserved() {
        let out = Cast::new(NumericType::Float64).apply(&arr1(&[0.25f32, 1.0]));
        let CastTensor::Float64(a) = out else { panic!("wrong variant") };
        assert_eq!(a.as_slice().unwrap(), &[0.25, 1.0]);
    }

    #[test]
    fn test_float16_cast() {
        let input = arr1(&[0.0f32, 0.5, 1.0 / 255.0, 1.0e6]);
        let CastTensor::Float16(h) = Cast::new(NumericType::Float16).apply(&input) else {
            panic!("wrong variant")
        };
        let h = h.as_slice().unwrap();
        assert_eq!(h[0], f16::ZERO);
        assert_eq!(h[1].to_f32(), 0.5);
        assert!((h[2].to_f32() - 1.0 / 255.0).abs() < 1e-5);
        assert!(h[3].is_infinite());
    }

    #[test]
    fn test_integer_cast_rounds_and_saturates() {
        let input = arr1(&[-3.6f32, 0.4, 2.5, 300.0, f32::NAN]);
        let CastTensor::Uint8(u) = Cast::new(NumericType::Uint8).apply(&input) else {
            panic!("wrong variant")
        };
        assert_eq!(u.as_slice().unwrap(), &[0, 0, 3, 255, 0]);
        let CastTensor::Int32(i) = Cast::new(NumericType::Int32).apply(&input) else {
            panic!("wrong variant")
        };
        assert_eq!(i.as_slice().unwrap(), &[-4, 0, 3, 300, 0]);
    }

    #[test]
    fn test_default_is_identity_float32() {
        let input = arr1(&[0.1f32, 0.2]);
        assert_eq!(Cast::default().apply(&input), CastTensor::Float32(input.into_dyn()));
    }
}
