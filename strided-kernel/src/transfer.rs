//! Element copy/cast between strided arrays.

use num_traits::AsPrimitive;
use strided_view::{can_cast, is_exposed, Casting, DType, Element, StridedArray, StridedError};

use crate::kernel::for_each_run;
use crate::Result;

/// Scalar types every primitive can be converted from with `as` semantics.
trait CastSource:
    Copy
    + 'static
    + AsPrimitive<i8>
    + AsPrimitive<i16>
    + AsPrimitive<i32>
    + AsPrimitive<i64>
    + AsPrimitive<u8>
    + AsPrimitive<u16>
    + AsPrimitive<u32>
    + AsPrimitive<u64>
    + AsPrimitive<f32>
    + AsPrimitive<f64>
{
}

impl<T> CastSource for T where
    T: Copy
        + 'static
        + AsPrimitive<i8>
        + AsPrimitive<i16>
        + AsPrimitive<i32>
        + AsPrimitive<i64>
        + AsPrimitive<u8>
        + AsPrimitive<u16>
        + AsPrimitive<u32>
        + AsPrimitive<u64>
        + AsPrimitive<f32>
        + AsPrimitive<f64>
{
}

#[inline]
unsafe fn cast_loop<S, D>(
    dst: *mut u8,
    dst_stride: isize,
    src: *const u8,
    src_stride: isize,
    count: usize,
) where
    S: AsPrimitive<D>,
    D: Copy + 'static,
{
    for i in 0..count as isize {
        let v = (src.offset(i * src_stride) as *const S).read_unaligned();
        (dst.offset(i * dst_stride) as *mut D).write_unaligned(v.as_());
    }
}

unsafe fn cast_from<S: CastSource>(
    dst: *mut u8,
    dst_stride: isize,
    dst_dtype: &DType,
    src: *const u8,
    src_stride: isize,
    count: usize,
) -> bool {
    macro_rules! to {
        ($d:ty) => {
            cast_loop::<S, $d>(dst, dst_stride, src, src_stride, count)
        };
    }
    match dst_dtype {
        DType::I8 => to!(i8),
        DType::I16 => to!(i16),
        DType::I32 => to!(i32),
        DType::I64 => to!(i64),
        DType::U8 => to!(u8),
        DType::U16 => to!(u16),
        DType::U32 => to!(u32),
        DType::U64 => to!(u64),
        DType::F32 => to!(f32),
        DType::F64 => to!(f64),
        DType::Record(_) => return false,
    }
    true
}

/// Copy `count` strided elements from `src` to `dst`, converting between dtypes.
///
/// Conversions follow `as` semantics (truncation, saturation for float to
/// int); callers check the casting policy. A `dst_stride` of 0 writes every
/// element into the same slot, leaving the last one.
///
/// # Errors
/// Records can only be copied to an identical record.
///
/// # Safety
/// Both pointers must be valid for `count` elements at their strides.
pub unsafe fn cast_strided(
    dst: *mut u8,
    dst_stride: isize,
    dst_dtype: &DType,
    src: *const u8,
    src_stride: isize,
    src_dtype: &DType,
    count: usize,
) -> Result<()> {
    if dst_dtype == src_dtype {
        let itemsize = dst_dtype.itemsize();
        for i in 0..count as isize {
            std::ptr::copy(
                src.offset(i * src_stride),
                dst.offset(i * dst_stride),
                itemsize,
            );
        }
        return Ok(());
    }

    macro_rules! from {
        ($s:ty) => {
            cast_from::<$s>(dst, dst_stride, dst_dtype, src, src_stride, count)
        };
    }
    let ok = match src_dtype {
        DType::I8 => from!(i8),
        DType::I16 => from!(i16),
        DType::I32 => from!(i32),
        DType::I64 => from!(i64),
        DType::U8 => from!(u8),
        DType::U16 => from!(u16),
        DType::U32 => from!(u32),
        DType::U64 => from!(u64),
        DType::F32 => from!(f32),
        DType::F64 => from!(f64),
        DType::Record(_) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StridedError::CastNotAllowed {
            from: src_dtype.clone(),
            to: dst_dtype.clone(),
            casting: Casting::Unsafe,
        })
    }
}

fn check_cast(from: &DType, to: &DType, casting: Casting) -> Result<()> {
    if can_cast(from, to, casting) {
        Ok(())
    } else {
        Err(StridedError::CastNotAllowed {
            from: from.clone(),
            to: to.clone(),
            casting,
        })
    }
}

/// Copy `src` (broadcast to `dst`'s shape) into `dst`.
///
/// With `preserve_na` and a masked `dst`, only exposed destination slots
/// are written and the destination mask is left alone. Otherwise every slot
/// is written and a destination mask takes the source's exposure (fully
/// exposed for an unmasked source).
pub fn assign_array(
    dst: &StridedArray,
    src: &StridedArray,
    casting: Casting,
    preserve_na: bool,
) -> Result<()> {
    check_cast(src.dtype(), dst.dtype(), casting)?;
    let src = src.broadcast_to(dst.dims())?;
    let (dst_ptr, src_ptr) = (dst.ptr(), src.ptr());
    let (dst_dtype, src_dtype) = (dst.dtype(), src.dtype());

    match (dst.mask_ptr(), dst.mask_strides()) {
        (Some(mask_ptr), Some(mask_strides)) if preserve_na => {
            for_each_run(
                dst.dims(),
                &[dst.strides(), src.strides(), mask_strides],
                Some(0),
                |offsets, len, inner| {
                    for i in 0..len as isize {
                        unsafe {
                            let m = *mask_ptr.offset(offsets[2] + i * inner[2]);
                            if is_exposed(m) {
                                cast_strided(
                                    dst_ptr.offset(offsets[0] + i * inner[0]),
                                    0,
                                    dst_dtype,
                                    src_ptr.offset(offsets[1] + i * inner[1]),
                                    0,
                                    src_dtype,
                                    1,
                                )?;
                            }
                        }
                    }
                    Ok(())
                },
            )
        }
        _ => {
            for_each_run(
                dst.dims(),
                &[dst.strides(), src.strides()],
                Some(0),
                |offsets, len, inner| unsafe {
                    cast_strided(
                        dst_ptr.offset(offsets[0]),
                        inner[0],
                        dst_dtype,
                        src_ptr.offset(offsets[1]),
                        inner[1],
                        src_dtype,
                        len,
                    )
                },
            )?;
            if dst.has_mask() {
                copy_exposure(dst, &src)?;
            }
            Ok(())
        }
    }
}

/// Set `dst`'s mask from `src`'s exposure (all exposed when `src` is unmasked).
fn copy_exposure(dst: &StridedArray, src: &StridedArray) -> Result<()> {
    let (dst_mask, dst_ms) = match (dst.mask_ptr(), dst.mask_strides()) {
        (Some(p), Some(s)) => (p, s),
        _ => return Err(StridedError::MissingMask),
    };
    match (src.mask_ptr(), src.mask_strides()) {
        (Some(src_mask), Some(src_ms)) => for_each_run(
            dst.dims(),
            &[dst_ms, src_ms],
            Some(0),
            |offsets, len, inner| {
                for i in 0..len as isize {
                    unsafe {
                        let m = *src_mask.offset(offsets[1] + i * inner[1]);
                        *dst_mask.offset(offsets[0] + i * inner[0]) = u8::from(is_exposed(m));
                    }
                }
                Ok(())
            },
        ),
        _ => dst.fill_mask(true),
    }
}

/// Write `value` (cast to `dst`'s dtype) into every slot of `dst`.
///
/// With `preserve_na` and a masked `dst`, only exposed slots are written and
/// the mask is untouched. Otherwise every slot is written and a mask, if
/// any, becomes fully exposed. This is the write policy identity callbacks
/// receive from the reduction driver.
pub fn assign_scalar<T: Element>(dst: &StridedArray, value: T, preserve_na: bool) -> Result<()> {
    let dst_ptr = dst.ptr();
    let dst_dtype = dst.dtype();
    let src_dtype = T::dtype();
    let src = &value as *const T as *const u8;

    match (dst.mask_ptr(), dst.mask_strides()) {
        (Some(mask_ptr), Some(mask_strides)) if preserve_na => for_each_run(
            dst.dims(),
            &[dst.strides(), mask_strides],
            Some(0),
            |offsets, len, inner| {
                for i in 0..len as isize {
                    unsafe {
                        if is_exposed(*mask_ptr.offset(offsets[1] + i * inner[1])) {
                            cast_strided(
                                dst_ptr.offset(offsets[0] + i * inner[0]),
                                0,
                                dst_dtype,
                                src,
                                0,
                                &src_dtype,
                                1,
                            )?;
                        }
                    }
                }
                Ok(())
            },
        ),
        _ => {
            for_each_run(
                dst.dims(),
                &[dst.strides()],
                Some(0),
                |offsets, len, inner| unsafe {
                    cast_strided(
                        dst_ptr.offset(offsets[0]),
                        inner[0],
                        dst_dtype,
                        src,
                        0,
                        &src_dtype,
                        len,
                    )
                },
            )?;
            if dst.has_mask() {
                dst.fill_mask(true)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_strided_int_to_float() {
        let src = [1i32, -2, 3];
        let mut dst = [0.0f64; 3];
        unsafe {
            cast_strided(
                dst.as_mut_ptr() as *mut u8,
                8,
                &DType::F64,
                src.as_ptr() as *const u8,
                4,
                &DType::I32,
                3,
            )
            .unwrap();
        }
        assert_eq!(dst, [1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_cast_strided_truncates_and_broadcasts() {
        let src = [2.9f64];
        let mut dst = [0i16; 4];
        unsafe {
            cast_strided(
                dst.as_mut_ptr() as *mut u8,
                2,
                &DType::I16,
                src.as_ptr() as *const u8,
                0,
                &DType::F64,
                4,
            )
            .unwrap();
        }
        assert_eq!(dst, [2, 2, 2, 2]);
    }

    #[test]
    fn test_cast_strided_record_rejected() {
        let rec = DType::record([("a", DType::I32)]);
        let src = [0u8; 4];
        let mut dst = [0u8; 4];
        let err = unsafe {
            cast_strided(dst.as_mut_ptr(), 4, &DType::I32, src.as_ptr(), 4, &rec, 1)
        };
        assert!(matches!(err, Err(StridedError::CastNotAllowed { .. })));
    }

    #[test]
    fn test_assign_array_broadcast_and_cast() {
        let src = StridedArray::from_vec(&[1, 3], vec![1i32, 2, 3]).unwrap();
        let dst = StridedArray::zeros(DType::F64, &[2, 3]).unwrap();
        assign_array(&dst, &src, Casting::SameKind, false).unwrap();
        assert_eq!(
            dst.to_vec::<f64>().unwrap(),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_assign_array_casting_policy() {
        let src = StridedArray::from_vec(&[2], vec![1.5f64, 2.5]).unwrap();
        let dst = StridedArray::zeros(DType::I32, &[2]).unwrap();
        assert!(matches!(
            assign_array(&dst, &src, Casting::SameKind, false),
            Err(StridedError::CastNotAllowed { .. })
        ));
        assign_array(&dst, &src, Casting::Unsafe, false).unwrap();
        assert_eq!(dst.to_vec::<i32>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_assign_array_preserve_na() {
        let src = StridedArray::from_vec(&[3], vec![7i64, 8, 9]).unwrap();
        let dst = StridedArray::from_vec(&[3], vec![0i64, 0, 0])
            .unwrap()
            .with_mask_values(&[true, false, true])
            .unwrap();
        assign_array(&dst, &src, Casting::No, true).unwrap();
        assert_eq!(dst.to_vec::<i64>().unwrap(), vec![7, 0, 9]);
        assert_eq!(dst.mask_values().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_assign_array_copies_exposure() {
        let src = StridedArray::from_vec(&[3], vec![7i64, 8, 9])
            .unwrap()
            .with_mask_values(&[false, true, true])
            .unwrap();
        let dst = StridedArray::from_vec(&[3], vec![0i64, 0, 0])
            .unwrap()
            .with_mask_values(&[true, false, true])
            .unwrap();
        assign_array(&dst, &src, Casting::No, false).unwrap();
        assert_eq!(dst.to_vec::<i64>().unwrap(), vec![7, 8, 9]);
        assert_eq!(dst.mask_values().unwrap(), vec![false, true, true]);
    }

    #[test]
    fn test_assign_scalar_policies() {
        let dst = StridedArray::zeros(DType::F32, &[2, 2])
            .unwrap()
            .with_mask_values(&[true, false, false, true])
            .unwrap();
        assign_scalar(&dst, 1u8, true).unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(dst.mask_values().unwrap(), vec![true, false, false, true]);

        assign_scalar(&dst, -3i32, false).unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![-3.0; 4]);
        assert_eq!(dst.mask_values().unwrap(), vec![true; 4]);
    }

    #[test]
    fn test_assign_scalar_zero_stride_view() {
        // result-style layout: reduced axis has stride 0
        let base = StridedArray::zeros(DType::I64, &[2, 1]).unwrap();
        let view = base.with_geometry(&[2, 1], &[8, 0], None).unwrap();
        assign_scalar(&view, 5i64, false).unwrap();
        assert_eq!(base.to_vec::<i64>().unwrap(), vec![5, 5]);
    }
}
