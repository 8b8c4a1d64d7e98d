// array.rs — host arrays and their device-ready form.
//
// `HostArray` is whatever the caller hands us: any supported element type,
// any memory layout ndarray can express (transposed views, strided slices,
// Fortran order). `DeviceArray` is what a device buffer actually holds:
// one of two 32-bit element types, packed row-major with no gaps.
//
// `normalize()` is the only way from one to the other.
//
//   element type          device type
//   ─────────────────────────────────────
//   f32, f64              f32
//   i32, i64              i32
//   u64  (8 bytes wide)   f32   lossy fallback
//   u8, u16, u32          error (no device representation)
//
// NEW RUST CONCEPTS:
// - `macro_rules!` — generates the eight near-identical `From` impls below
//   instead of writing them out by hand.
// - `ArrayD<T>` / `IxDyn` — ndarray's dynamic-rank array. The rank is only
//   known at runtime, exactly like the shape tuples this crate passes around.

use std::fmt;

use ndarray::{Array, ArrayD, ArrayViewD, Dimension, IxDyn};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Element type of a [`HostArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F64,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl ElementType {
    /// Element width in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 4,
            ElementType::F64 | ElementType::I64 | ElementType::U64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    /// The device element type this host type is normalized to.
    pub fn device_type(self) -> Result<DType> {
        match self {
            ElementType::F32 | ElementType::F64 => Ok(DType::F32),
            ElementType::I32 | ElementType::I64 => Ok(DType::I32),
            // Other 8-byte-wide types fall back to f32.
            other if other.size() == 8 => Ok(DType::F32),
            other => Err(Error::UnsupportedElementType(other)),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
        };
        f.write_str(name)
    }
}

/// Element type of a device buffer. Every device element is 4 bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
}

impl DType {
    pub const fn size(self) -> usize {
        4
    }

    /// Bytes needed for `shape` elements of this type.
    pub fn nbytes(self, shape: &[usize]) -> u64 {
        (shape.iter().product::<usize>() * self.size()) as u64
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => f.write_str("f32"),
            DType::I32 => f.write_str("i32"),
        }
    }
}

// ---------------------------------------------------------------------------
// HostArray
// ---------------------------------------------------------------------------

/// An arbitrary host numeric array, in any memory layout.
#[derive(Debug, Clone, PartialEq)]
pub enum HostArray {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
}

macro_rules! host_array_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl<D: Dimension> From<Array<$ty, D>> for HostArray {
                fn from(a: Array<$ty, D>) -> Self {
                    HostArray::$variant(a.into_dyn())
                }
            }
        )*
    };
}

host_array_from!(
    f32 => F32,
    f64 => F64,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
);

impl HostArray {
    pub fn element_type(&self) -> ElementType {
        match self {
            HostArray::F32(_) => ElementType::F32,
            HostArray::F64(_) => ElementType::F64,
            HostArray::I32(_) => ElementType::I32,
            HostArray::I64(_) => ElementType::I64,
            HostArray::U8(_) => ElementType::U8,
            HostArray::U16(_) => ElementType::U16,
            HostArray::U32(_) => ElementType::U32,
            HostArray::U64(_) => ElementType::U64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            HostArray::F32(a) => a.shape(),
            HostArray::F64(a) => a.shape(),
            HostArray::I32(a) => a.shape(),
            HostArray::I64(a) => a.shape(),
            HostArray::U8(a) => a.shape(),
            HostArray::U16(a) => a.shape(),
            HostArray::U32(a) => a.shape(),
            HostArray::U64(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the elements are laid out contiguously in row-major order.
    pub fn is_standard_layout(&self) -> bool {
        match self {
            HostArray::F32(a) => a.is_standard_layout(),
            HostArray::F64(a) => a.is_standard_layout(),
            HostArray::I32(a) => a.is_standard_layout(),
            HostArray::I64(a) => a.is_standard_layout(),
            HostArray::U8(a) => a.is_standard_layout(),
            HostArray::U16(a) => a.is_standard_layout(),
            HostArray::U32(a) => a.is_standard_layout(),
            HostArray::U64(a) => a.is_standard_layout(),
        }
    }

    /// Convert every element to `f32`, row-major.
    ///
    /// Unlike [`normalize`], integer arrays are converted by value, which is
    /// what a float kernel wants to read.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            HostArray::F32(a) => a.as_standard_layout().into_owned(),
            HostArray::F64(a) => a.mapv(|v| v as f32),
            HostArray::I32(a) => a.mapv(|v| v as f32),
            HostArray::I64(a) => a.mapv(|v| v as f32),
            HostArray::U8(a) => a.mapv(f32::from),
            HostArray::U16(a) => a.mapv(f32::from),
            HostArray::U32(a) => a.mapv(|v| v as f32),
            HostArray::U64(a) => a.mapv(|v| v as f32),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceArray
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum DeviceData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

/// A contiguous row-major array of a device element type.
///
/// This is the host-side image of a device buffer: the input of every
/// host→device transfer and the result of every device→host transfer.
/// The data vector always holds exactly `shape.iter().product()` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceArray {
    shape: Vec<usize>,
    data: DeviceData,
}

impl DeviceArray {
    /// A zero-filled array, used as a fetch destination.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let len = shape.iter().product();
        let data = match dtype {
            DType::F32 => DeviceData::F32(vec![0.0; len]),
            DType::I32 => DeviceData::I32(vec![0; len]),
        };
        DeviceArray { shape: shape.to_vec(), data }
    }

    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::check_len(shape, data.len())?;
        Ok(DeviceArray { shape: shape.to_vec(), data: DeviceData::F32(data) })
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        Self::check_len(shape, data.len())?;
        Ok(DeviceArray { shape: shape.to_vec(), data: DeviceData::I32(data) })
    }

    fn check_len(shape: &[usize], len: usize) -> Result<()> {
        let expected: usize = shape.iter().product();
        if expected != len {
            return Err(Error::ShapeMismatch { expected: shape.to_vec(), actual: vec![len] });
        }
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            DeviceData::F32(_) => DType::F32,
            DeviceData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            DeviceData::F32(v) => v.len(),
            DeviceData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> u64 {
        (self.len() * self.dtype().size()) as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            DeviceData::F32(v) => bytemuck::cast_slice(v),
            DeviceData::I32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            DeviceData::F32(v) => bytemuck::cast_slice_mut(v),
            DeviceData::I32(v) => bytemuck::cast_slice_mut(v),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            DeviceData::F32(v) => Some(v),
            DeviceData::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            DeviceData::I32(v) => Some(v),
            DeviceData::F32(_) => None,
        }
    }

    /// Borrow as an ndarray view if the elements are `f32`.
    pub fn view_f32(&self) -> Option<ArrayViewD<'_, f32>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), self.as_f32()?).ok()
    }

    /// Convert into an owned ndarray if the elements are `f32`.
    pub fn into_f32_array(self) -> Option<ArrayD<f32>> {
        match self.data {
            DeviceData::F32(v) => ArrayD::from_shape_vec(IxDyn(&self.shape), v).ok(),
            DeviceData::I32(_) => None,
        }
    }

    /// Convert into an owned ndarray if the elements are `i32`.
    pub fn into_i32_array(self) -> Option<ArrayD<i32>> {
        match self.data {
            DeviceData::I32(v) => ArrayD::from_shape_vec(IxDyn(&self.shape), v).ok(),
            DeviceData::F32(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Produce the device-ready form of `array`.
///
/// Casts to the device element type (see the table at the top of this file)
/// and packs the elements row-major. `iter()` walks the array in logical
/// row-major order whatever its memory layout, so non-contiguous inputs
/// come out contiguous. The input is never modified.
///
/// Integer narrowing wraps, like a C cast: `i64` values outside the `i32`
/// range do not survive.
pub fn normalize(array: &HostArray) -> Result<DeviceArray> {
    let shape = array.shape().to_vec();
    let data = match array {
        HostArray::F32(a) => DeviceData::F32(a.iter().copied().collect()),
        HostArray::F64(a) => DeviceData::F32(a.iter().map(|&v| v as f32).collect()),
        HostArray::I32(a) => DeviceData::I32(a.iter().copied().collect()),
        HostArray::I64(a) => DeviceData::I32(a.iter().map(|&v| v as i32).collect()),
        HostArray::U64(a) => DeviceData::F32(a.iter().map(|&v| v as f32).collect()),
        other => return Err(Error::UnsupportedElementType(other.element_type())),
    };
    Ok(DeviceArray { shape, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array2, Array3};

    #[test]
    fn test_float_types_become_f32() {
        let a = normalize(&HostArray::from(arr1(&[1.5f64, -2.25, 3.0]))).unwrap();
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.as_f32().unwrap(), &[1.5, -2.25, 3.0]);
        assert_eq!(a.nbytes(), 12);
    }

    #[test]
    fn test_integer_types_become_i32() {
        let a = normalize(&HostArray::from(arr2(&[[1i64, 2], [3, -4]]))).unwrap();
        assert_eq!(a.dtype(), DType::I32);
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(a.as_i32().unwrap(), &[1, 2, 3, -4]);
    }

    #[test]
    fn test_u64_falls_back_to_f32() {
        let a = normalize(&HostArray::from(arr1(&[7u64, 9]))).unwrap();
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.as_f32().unwrap(), &[7.0, 9.0]);
    }

    #[test]
    fn test_unclassified_types_are_rejected() {
        let err = normalize(&HostArray::from(arr1(&[1u8, 2, 3]))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedElementType(ElementType::U8)));
        assert!(ElementType::U32.device_type().is_err());
        assert!(ElementType::U16.device_type().is_err());
    }

    #[test]
    fn test_transposed_input_is_packed_row_major() {
        // [[0,1,2],[3,4,5]] transposed is [[0,3],[1,4],[2,5]].
        let a = Array2::from_shape_vec((2, 3), (0..6).map(|v| v as f32).collect()).unwrap();
        let t = HostArray::from(a.reversed_axes());
        assert!(!t.is_standard_layout());

        let d = normalize(&t).unwrap();
        assert_eq!(d.shape(), &[3, 2]);
        assert_eq!(d.as_f32().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_input_untouched() {
        let src = HostArray::from(Array3::<f64>::from_elem((2, 2, 2), 0.1));
        let before = src.clone();
        let _ = normalize(&src).unwrap();
        assert_eq!(src, before);
    }

    #[test]
    fn test_device_array_bytes() {
        let mut a = DeviceArray::zeros(&[2, 3], DType::I32);
        assert_eq!(a.as_bytes().len(), 24);
        a.as_bytes_mut()[0] = 5;
        assert_eq!(a.as_i32().unwrap()[0], 5);
        assert!(a.view_f32().is_none());
    }

    #[test]
    fn test_from_f32_checks_length() {
        assert!(DeviceArray::from_f32(&[2, 2], vec![0.0; 3]).is_err());
        let a = DeviceArray::from_f32(&[2, 2], vec![1.0; 4]).unwrap();
        assert_eq!(a.into_f32_array().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn test_to_f32_converts_by_value() {
        let a = HostArray::from(arr1(&[3i32, -1]));
        assert_eq!(a.to_f32().as_slice().unwrap(), &[3.0, -1.0]);
    }
}
