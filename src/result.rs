//! Building and validating the result container of a reduction.
//!
//! A result container always has the operand's rank: reduction axes have
//! extent 1 and, when freshly allocated, stride 0, so that iterating it
//! together with the operand broadcasts along those axes.

use strided_view::{sorted_stride_perm, DType, StridedArray};

use crate::{check_axis_flags, ReduceError, Result};

/// Allocate a result container for reducing `operand` along `axis_flags`.
///
/// The kept axes are laid out contiguously in the operand's stride order
/// (largest stride outermost), which keeps the paired walk over result and
/// operand cache friendly whatever the operand's memory order. Reduction
/// axes get extent 1 and stride 0.
///
/// `dtype` defaults to the operand's. With `preserve_subtype` the result
/// inherits the operand's subtype tag.
pub fn allocate_reduce_result(
    operand: &StridedArray,
    axis_flags: &[bool],
    dtype: Option<DType>,
    preserve_subtype: bool,
) -> Result<StridedArray> {
    let ndim = operand.ndim();
    check_axis_flags(ndim, axis_flags)?;
    let dtype = dtype.unwrap_or_else(|| operand.dtype().clone());

    let perm = sorted_stride_perm(operand.strides());
    let mut dims = vec![1usize; ndim];
    let mut strides = vec![0isize; ndim];
    let mut stride = dtype.itemsize() as isize;
    for &axis in perm.iter().rev() {
        if !axis_flags[axis] {
            dims[axis] = operand.dims()[axis];
            strides[axis] = stride;
            stride *= dims[axis] as isize;
        }
    }

    let result = StridedArray::with_layout(dtype, &dims, &strides)?;
    Ok(if preserve_subtype {
        result.with_tag(operand.tag())
    } else {
        result
    })
}

/// View `out` with the operand's rank, so it can be iterated against the operand.
///
/// With `keepdims`, `out` must already have the operand's rank and extent 1
/// on every reduction axis; the returned handle aliases it unchanged.
/// Otherwise an extent-1, stride-0 axis is inserted at every reduction axis
/// (in the mask too), and the remaining axes of `out` map in order onto the
/// kept axes.
pub fn conform_reduce_result(
    ndim: usize,
    axis_flags: &[bool],
    out: &StridedArray,
    keepdims: bool,
    name: &str,
) -> Result<StridedArray> {
    check_axis_flags(ndim, axis_flags)?;

    if keepdims {
        if out.ndim() != ndim {
            return Err(ReduceError::KeepdimsRankMismatch { name: name.into() });
        }
        if (0..ndim).any(|i| axis_flags[i] && out.dims()[i] != 1) {
            return Err(ReduceError::KeepdimsExtentNotOne { name: name.into() });
        }
        return Ok(out.clone());
    }

    let out_mask_strides = out.mask_strides();
    let mut dims = Vec::with_capacity(ndim);
    let mut strides = Vec::with_capacity(ndim);
    let mut mask_strides = out_mask_strides.map(|_| Vec::with_capacity(ndim));
    let mut idim_out = 0usize;
    for &reduced in axis_flags {
        if reduced {
            dims.push(1);
            strides.push(0);
            if let Some(ms) = mask_strides.as_mut() {
                ms.push(0);
            }
        } else {
            if idim_out >= out.ndim() {
                return Err(ReduceError::NotEnoughDimensions { name: name.into() });
            }
            dims.push(out.dims()[idim_out]);
            strides.push(out.strides()[idim_out]);
            if let (Some(ms), Some(src)) = (mask_strides.as_mut(), out_mask_strides) {
                ms.push(src[idim_out]);
            }
            idim_out += 1;
        }
    }
    if idim_out != out.ndim() {
        return Err(ReduceError::TooManyDimensions { name: name.into() });
    }

    Ok(out.with_geometry(&dims, &strides, mask_strides.as_deref())?)
}

/// Allocate a result container, or conform a caller-provided one.
///
/// Without `out`, a new container of `dtype` is allocated and, with
/// `need_mask`, given a fully exposed mask. With `out`, `dtype` is ignored
/// (converting is up to the iteration) and `out` must already carry a mask
/// when `need_mask` is set.
#[allow(clippy::too_many_arguments)]
pub fn create_reduce_result(
    operand: &StridedArray,
    out: Option<&StridedArray>,
    dtype: DType,
    axis_flags: &[bool],
    need_mask: bool,
    keepdims: bool,
    preserve_subtype: bool,
    name: &str,
) -> Result<StridedArray> {
    match out {
        None => {
            let mut result =
                allocate_reduce_result(operand, axis_flags, Some(dtype), preserve_subtype)?;
            if need_mask {
                result.attach_mask(true)?;
            }
            Ok(result)
        }
        Some(out) => {
            if need_mask && !out.has_mask() {
                return Err(ReduceError::OutputNeedsMask { name: name.into() });
            }
            conform_reduce_result(operand.ndim(), axis_flags, out, keepdims, name)
        }
    }
}
