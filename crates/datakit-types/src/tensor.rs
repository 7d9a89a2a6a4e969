//! Typed n-dimensional tensors carried by observations and actions.

use serde::{Deserialize, Serialize};

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Uint8,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

impl DType {
    /// Wire-format name, matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Uint8 => "uint8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
        }
    }

    /// Parse a wire-format dtype name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bool" => Some(Self::Bool),
            "uint8" => Some(Self::Uint8),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::String)
    }

    /// Narrowest dtype that holds every value of both `self` and `other`.
    ///
    /// Integers mixed with `float32` widen to `float64`; anything mixed
    /// with strings becomes a string.
    #[must_use]
    pub fn widen(self, other: Self) -> Self {
        use DType::{Bool, Float32, Float64, Int32, Int64, String, Uint8};
        match (self.min(other), self.max(other)) {
            (a, b) if a == b => a,
            (_, String) => String,
            (_, Float64) | (Int32 | Int64, Float32) => Float64,
            (Bool | Uint8, Float32) => Float32,
            (_, b) => b,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat element storage, tagged by dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "data", rename_all = "lowercase")]
pub enum TensorData {
    Bool(Vec<bool>),
    Uint8(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

impl TensorData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Uint8(_) => DType::Uint8,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::String(_) => DType::String,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Uint8(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::String(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised when constructing a tensor from inconsistent parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements but {actual} were supplied")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// An n-dimensional, row-major tensor.
///
/// A scalar has an empty `shape` and exactly one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    #[serde(flatten)]
    pub data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that `shape` accounts for every element.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] when the element count implied
    /// by `shape` differs from the supplied data length.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional `float32` vector.
    #[must_use]
    pub fn vector_f32(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::Float32(values),
        }
    }

    /// One-dimensional `float64` vector.
    #[must_use]
    pub fn vector_f64(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::Float64(values),
        }
    }

    /// Scalar `float64`.
    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::Float64(vec![value]),
        }
    }

    /// Scalar string, used for language observations.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::String(vec![value.into()]),
        }
    }

    /// `uint8` image in height-width-channel layout.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] when `pixels` does not hold
    /// exactly `height * width * channels` bytes.
    pub fn image(
        height: usize,
        width: usize,
        channels: usize,
        pixels: Vec<u8>,
    ) -> Result<Self, TensorError> {
        Self::new(vec![height, width, channels], TensorData::Uint8(pixels))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Widen every numeric element to `f64`. Returns `None` for strings.
    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        let values = match &self.data {
            TensorData::Bool(v) => v.iter().map(|b| f64::from(u8::from(*b))).collect(),
            TensorData::Uint8(v) => v.iter().map(|x| f64::from(*x)).collect(),
            TensorData::Int32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            #[allow(clippy::cast_precision_loss)]
            TensorData::Int64(v) => v.iter().map(|x| *x as f64).collect(),
            TensorData::Float32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            TensorData::Float64(v) => v.clone(),
            TensorData::String(_) => return None,
        };
        Some(values)
    }

    /// First string element, if this is a string tensor.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            TensorData::String(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// `true` when every floating-point element is finite. Integer, boolean
    /// and string tensors are always finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match &self.data {
            TensorData::Float32(v) => v.iter().all(|x| x.is_finite()),
            TensorData::Float64(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_widening() {
        assert_eq!(DType::Uint8.widen(DType::Int32), DType::Int32);
        assert_eq!(DType::Int32.widen(DType::Uint8), DType::Int32);
        assert_eq!(DType::Uint8.widen(DType::Float32), DType::Float32);
        assert_eq!(DType::Int64.widen(DType::Float32), DType::Float64);
        assert_eq!(DType::Bool.widen(DType::Bool), DType::Bool);
        assert_eq!(DType::Float64.widen(DType::String), DType::String);
    }

    #[test]
    fn new_rejects_wrong_element_count() {
        let err = Tensor::new(vec![2, 3], TensorData::Float32(vec![0.0; 5])).unwrap_err();
        assert_eq!(
            err,
            TensorError::ShapeMismatch {
                shape: vec![2, 3],
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn scalar_has_empty_shape() {
        let t = Tensor::scalar_f64(1.5);
        assert!(t.shape.is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn image_shape_is_hwc() {
        let t = Tensor::image(2, 4, 3, vec![0; 24]).unwrap();
        assert_eq!(t.shape, vec![2, 4, 3]);
        assert_eq!(t.dtype(), DType::Uint8);
    }

    #[test]
    fn finite_check_only_applies_to_floats() {
        assert!(!Tensor::vector_f32(vec![1.0, f32::NAN]).is_finite());
        assert!(!Tensor::vector_f64(vec![f64::INFINITY]).is_finite());
        assert!(Tensor::text("pick").is_finite());
    }

    #[test]
    fn widening_to_f64() {
        let t = Tensor::new(vec![3], TensorData::Int32(vec![-1, 0, 7])).unwrap();
        assert_eq!(t.to_f64_vec(), Some(vec![-1.0, 0.0, 7.0]));
        assert_eq!(Tensor::text("x").to_f64_vec(), None);
    }

    #[test]
    fn serde_uses_dtype_tag() {
        let t = Tensor::vector_f32(vec![1.0, 2.0]);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["dtype"], "float32");
        assert_eq!(json["shape"], serde_json::json!([2]));
        let back: Tensor = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn dtype_parse_matches_as_str() {
        for dtype in [
            DType::Bool,
            DType::Uint8,
            DType::Int32,
            DType::Int64,
            DType::Float32,
            DType::Float64,
            DType::String,
        ] {
            assert_eq!(DType::parse(dtype.as_str()), Some(dtype));
        }
        assert_eq!(DType::parse("complex64"), None);
    }
}
