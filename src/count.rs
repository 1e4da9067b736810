//! Counting the elements a reduction actually combines.
//!
//! Divisor-style reductions (mean, var, ...) need the number of elements
//! contributing to each result slot, which differs per slot once hidden
//! elements are skipped.

use strided_kernel::{assign_scalar, for_each_run};
use strided_view::{is_exposed, DType, MaskKind, StridedArray, StridedError};

use crate::{allocate_reduce_result, check_axis_flags, ReduceError, Result};

/// Number of elements reduced into each result slot.
#[derive(Clone, Debug)]
pub enum ReducedCount {
    /// Every slot combines the same number of elements.
    Total(usize),
    /// Per-slot counts as an `I64` array shaped like the reduction result.
    PerSlot(StridedArray),
}

impl ReducedCount {
    /// Count for the slot at `idx` of the result.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds for per-slot counts. A
    /// [`ReducedCount::Total`] ignores `idx`.
    pub fn at(&self, idx: &[usize]) -> usize {
        match self {
            ReducedCount::Total(n) => *n,
            ReducedCount::PerSlot(counts) => counts.get::<i64>(idx) as usize,
        }
    }
}

/// Count how many elements of `operand` reduce into each result slot.
///
/// Without `skipna`, or for an unmasked operand, this is the product of the
/// reduced extents. Otherwise the exposed elements are counted per slot.
pub fn count_reduce_items(
    operand: &StridedArray,
    axis_flags: &[bool],
    skipna: bool,
    keepdims: bool,
) -> Result<ReducedCount> {
    check_axis_flags(operand.ndim(), axis_flags)?;

    let (mask, mask_strides) = match (operand.mask_ptr(), operand.mask_strides()) {
        (Some(p), Some(s)) if skipna => (p, s),
        _ => {
            let total = operand
                .dims()
                .iter()
                .zip(axis_flags)
                .filter(|(_, &f)| f)
                .map(|(&d, _)| d)
                .product();
            log::debug!("count_reduce_items: {total} per slot");
            return Ok(ReducedCount::Total(total));
        }
    };

    if operand.dtype().has_fields() {
        return Err(ReduceError::FieldNaUnsupported);
    }
    if operand.mask().map(|m| m.kind()) == Some(MaskKind::Multi) {
        return Err(ReduceError::MultiNaUnsupported);
    }

    let counts = allocate_reduce_result(operand, axis_flags, Some(DType::I64), false)?;
    assign_scalar(&counts, 0i64, false)?;

    let walk = counts.broadcast_to(operand.dims())?;
    let counts_ptr = walk.ptr();
    log::debug!(
        "count_reduce_items: counting exposed elements of {:?} into {:?}",
        operand.dims(),
        counts.dims()
    );
    // Weight the operand's mask so the walk follows its memory order.
    for_each_run::<StridedError, _>(
        operand.dims(),
        &[walk.strides(), mask_strides],
        Some(1),
        |offsets, len, inner| {
            for i in 0..len as isize {
                unsafe {
                    if is_exposed(*mask.offset(offsets[1] + i * inner[1])) {
                        let slot = counts_ptr.offset(offsets[0] + i * inner[0]) as *mut i64;
                        slot.write_unaligned(slot.read_unaligned() + 1);
                    }
                }
            }
            Ok(())
        },
    )?;

    let counts = if keepdims {
        counts
    } else {
        counts.remove_axes(axis_flags)?
    };
    Ok(ReducedCount::PerSlot(counts))
}
