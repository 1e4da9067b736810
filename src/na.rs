//! NA mask helpers used by the reduction driver.

use strided_kernel::for_each_run;
use strided_view::{is_exposed, StridedArray, StridedError, MASK_HIDDEN};

use crate::Result;

/// Whether any element of `array` is hidden. Unmasked arrays contain no NA.
pub fn contains_na(array: &StridedArray) -> bool {
    struct Found;

    let (Some(mask), Some(strides)) = (array.mask_ptr(), array.mask_strides()) else {
        return false;
    };
    for_each_run(array.dims(), &[strides], None, |offsets, len, inner| {
        for i in 0..len as isize {
            if !is_exposed(unsafe { *mask.offset(offsets[0] + i * inner[0]) }) {
                return Err(Found);
            }
        }
        Ok(())
    })
    .is_err()
}

/// Reduce `operand`'s mask into `result`'s mask with NA propagation.
///
/// `result` must have the operand's rank with extent 1 on the reduction axes.
/// A result slot ends up exposed iff every operand element reducing into it
/// is exposed. Slots with no contributing elements stay exposed.
pub fn reduce_mask_into(operand: &StridedArray, result: &StridedArray) -> Result<()> {
    result.fill_mask(true)?;
    let (Some(op_mask), Some(op_ms)) = (operand.mask_ptr(), operand.mask_strides()) else {
        return Ok(());
    };

    let result = result.broadcast_to(operand.dims())?;
    let (Some(res_mask), Some(res_ms)) = (result.mask_ptr(), result.mask_strides()) else {
        return Err(StridedError::MissingMask.into());
    };

    for_each_run::<StridedError, _>(operand.dims(), &[res_ms, op_ms], Some(0), |offsets, len, inner| {
        for i in 0..len as isize {
            unsafe {
                if !is_exposed(*op_mask.offset(offsets[1] + i * inner[1])) {
                    *res_mask.offset(offsets[0] + i * inner[0]) = MASK_HIDDEN;
                }
            }
        }
        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strided_view::DType;

    #[test]
    fn test_contains_na() {
        let plain = StridedArray::from_vec(&[2, 2], vec![1u8, 2, 3, 4]).unwrap();
        assert!(!contains_na(&plain));
        let all = plain.clone().with_mask_values(&[true; 4]).unwrap();
        assert!(!contains_na(&all));
        let one = plain.with_mask_values(&[true, true, false, true]).unwrap();
        assert!(contains_na(&one));
    }

    #[test]
    fn test_reduce_mask_propagates() {
        let a = StridedArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
            .with_mask_values(&[true, false, true, true, true, true])
            .unwrap();
        let mut rows = StridedArray::zeros(DType::F64, &[2, 1]).unwrap();
        rows.attach_mask(false).unwrap();
        reduce_mask_into(&a, &rows).unwrap();
        assert_eq!(rows.mask_values().unwrap(), vec![false, true]);

        let mut cols = StridedArray::zeros(DType::F64, &[1, 3]).unwrap();
        cols.attach_mask(true).unwrap();
        reduce_mask_into(&a, &cols).unwrap();
        assert_eq!(cols.mask_values().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_reduce_mask_requires_result_mask() {
        let a = StridedArray::zeros(DType::F64, &[2]).unwrap();
        let r = StridedArray::zeros(DType::F64, &[1]).unwrap();
        assert!(reduce_mask_into(&a, &r).is_err());
    }
}
