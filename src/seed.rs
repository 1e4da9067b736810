//! Seeding the result of reductions that have no identity element.
//!
//! Without an identity (max, min, ...) the result must start from actual
//! operand values. The seeder copies one contributing element into every
//! result slot and hands back the part of the operand still to be combined.

use strided_kernel::{assign_array, cast_strided, IterConfig, IterOperand, MaskUse, NdIter};
use strided_view::{Casting, DType, StridedArray};

use crate::{check_axis_flags, ReduceError, Result};

/// Outcome of [`seed_reduce_result`].
#[derive(Clone, Debug)]
pub struct Seeded {
    /// Operand elements the main pass still has to combine.
    pub view: StridedArray,
    /// Number of leading (already seeded) elements per result slot the inner
    /// loop must skip; nonzero only when the seeds could not be cut out of
    /// `view`.
    pub skip_first_count: usize,
}

/// Fail if a non-reorderable reduction names more than one axis.
pub fn check_nonreorderable_axes(axis_flags: &[bool], name: &str) -> Result<()> {
    if axis_flags.iter().filter(|&&f| f).count() > 1 {
        return Err(ReduceError::NotReorderable { name: name.into() });
    }
    Ok(())
}

/// Seed `result` with the first contributing element of every reduction group.
///
/// - Without `skipna`, or for an unmasked operand, the element at index 0 of
///   every reduction axis is copied, leaving hidden result slots untouched.
///   The remaining view skips those elements when there is exactly one
///   reduction axis, is empty with none, and is the whole operand (with
///   `skip_first_count` set to the result size) with several.
/// - With `skipna` and a masked rank-1 operand reduced along its axis, hidden
///   elements are skipped from the front first.
/// - With `skipna` and any other masked operand, the first exposed element
///   of each group is copied and hidden in a private copy of the operand's
///   mask, which the returned view carries.
///
/// With `skipna` a result mask ends up fully exposed.
pub fn seed_reduce_result(
    result: &StridedArray,
    operand: &StridedArray,
    axis_flags: &[bool],
    reorderable: bool,
    skipna: bool,
    name: &str,
) -> Result<Seeded> {
    check_axis_flags(operand.ndim(), axis_flags)?;
    if !reorderable {
        check_nonreorderable_axes(axis_flags, name)?;
    }

    let view = if !skipna || !operand.has_mask() {
        if operand.is_empty() {
            return Err(ReduceError::EmptyNoIdentity { name: name.into() });
        }
        operand.clone()
    } else if operand.ndim() == 1 && axis_flags[0] {
        let n = operand.dims()[0];
        let first = (0..n).find(|&i| operand.is_exposed(&[i]));
        match first {
            Some(i) => {
                log::trace!("{name}: skipped {i} leading NA elements");
                operand.offset_view(&[i], &[n - i])?
            }
            None => return Err(ReduceError::AllNaNoIdentity { name: name.into() }),
        }
    } else {
        return seed_scattered(result, operand, name);
    };

    if skipna && result.has_mask() {
        result.fill_mask(true)?;
    }

    // The first element along every reduction axis.
    let dims = view.dims().to_vec();
    let zeros = vec![0usize; dims.len()];
    let head_extents: Vec<usize> = dims
        .iter()
        .zip(axis_flags)
        .map(|(&d, &f)| if f { 1 } else { d })
        .collect();
    let head = view.offset_view(&zeros, &head_extents)?;
    assign_array(result, &head.without_mask(), Casting::Unsafe, !skipna)?;

    let nreduce = axis_flags.iter().filter(|&&f| f).count();
    let seeded = match nreduce {
        0 => Seeded {
            view: empty_view(&view)?,
            skip_first_count: 0,
        },
        1 => {
            let starts: Vec<usize> = axis_flags.iter().map(|&f| usize::from(f)).collect();
            let extents: Vec<usize> = dims
                .iter()
                .zip(axis_flags)
                .map(|(&d, &f)| if f { d - 1 } else { d })
                .collect();
            Seeded {
                view: view.offset_view(&starts, &extents)?,
                skip_first_count: 0,
            }
        }
        _ => Seeded {
            view: operand.clone(),
            skip_first_count: result.len(),
        },
    };
    log::trace!(
        "{name}: seeded {nreduce} reduction axes, skip_first_count={}",
        seeded.skip_first_count
    );
    Ok(seeded)
}

/// A zero-size view of `view`. A rank-0 view becomes rank 1 with extent 0,
/// as no rank-0 view is empty.
fn empty_view(view: &StridedArray) -> Result<StridedArray> {
    let rank = view.ndim().max(1);
    let zeros = vec![0isize; rank];
    let mask_strides = view.mask_strides().map(|_| zeros.as_slice());
    Ok(view.with_geometry(&vec![0; rank], &zeros, mask_strides)?)
}

/// Seed each result slot with its first exposed operand element.
///
/// The copied elements are hidden in a private mask copy so the main pass
/// skips them; the caller's operand mask is never modified.
fn seed_scattered(result: &StridedArray, operand: &StridedArray, name: &str) -> Result<Seeded> {
    let private = operand.with_owned_mask_copy()?;
    let tracking = StridedArray::zeros(DType::U8, result.dims())?;
    let mut remaining = result.len();

    if remaining > 0 {
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(private.clone()).mask_use(MaskUse::Use),
                IterOperand::read_write(result.without_mask()),
                IterOperand::read_write(tracking),
            ],
            IterConfig::default(),
        )?;
        let op_mask = iter.mask_stream(0).ok_or(strided_view::StridedError::MissingMask)?;
        let (op_dtype, res_dtype) = (operand.dtype().clone(), result.dtype().clone());

        if iter.size() > 0 {
            'runs: loop {
                for i in 0..iter.inner_len() {
                    if iter.read::<u8>(2, i) != 0 || !iter.exposed(op_mask, i) {
                        continue;
                    }
                    unsafe {
                        cast_strided(
                            iter.element_ptr(1, i),
                            0,
                            &res_dtype,
                            iter.element_ptr(0, i),
                            0,
                            &op_dtype,
                            1,
                        )?;
                    }
                    iter.write::<u8>(2, i, 1);
                    iter.set_exposed(op_mask, i, false);
                    remaining -= 1;
                    if remaining == 0 {
                        break 'runs;
                    }
                }
                if !iter.advance()? {
                    break;
                }
            }
        }
    }

    if remaining != 0 {
        return Err(ReduceError::AllNaOutputElement { name: name.into() });
    }
    if result.has_mask() {
        result.fill_mask(true)?;
    }
    log::trace!("{name}: scattered seed of {} result slots", result.len());

    Ok(Seeded {
        view: private,
        skip_first_count: 0,
    })
}
