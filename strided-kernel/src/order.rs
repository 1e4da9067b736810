//! Loop order selection.
//!
//! Every axis gets an importance key built from its stride rank in each
//! operand; the axis scoring highest runs innermost. One operand (the result
//! of a reduction) can be weighted double so its layout wins ties against the
//! inputs.

use crate::fuse::{compute_importance, sort_by_importance};
use strided_view::auxiliary::index_order;

/// Axes of `dims`, innermost first.
///
/// `weighted` names the stride set counted twice. Unit axes score zero and
/// end up outermost.
pub(crate) fn compute_order(
    dims: &[usize],
    strides_list: &[&[isize]],
    weighted: Option<usize>,
) -> Vec<usize> {
    if dims.is_empty() {
        return Vec::new();
    }
    if strides_list.is_empty() {
        return (0..dims.len()).collect();
    }

    // compute_importance doubles whatever sits in slot 0
    let mut sets: Vec<&[isize]> = strides_list.to_vec();
    if let Some(w) = weighted.filter(|&w| w < sets.len()) {
        sets.swap(0, w);
    }
    let ranks: Vec<Vec<usize>> = sets.iter().map(|s| index_order(s)).collect();

    sort_by_importance(&compute_importance(dims, &sets, &ranks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_axis_runs_innermost() {
        assert_eq!(compute_order(&[4, 5], &[&[40, 8]], Some(0)), vec![1, 0]);
        assert_eq!(compute_order(&[4, 5], &[&[8, 32]], Some(0)), vec![0, 1]);
        assert_eq!(compute_order(&[4, 5], &[&[-8, -32]], None), vec![0, 1]);
    }

    #[test]
    fn test_weighted_set_wins() {
        let result = [8isize, 32];
        let input = [40isize, 8];
        assert_eq!(compute_order(&[4, 5], &[&result, &input], Some(0))[0], 0);
        assert_eq!(compute_order(&[4, 5], &[&result, &input], Some(1))[0], 1);
    }

    #[test]
    fn test_reduced_axis_of_row_major_input() {
        // result (2, 1) broadcast over a row-major (2, 3) input
        let order = compute_order(&[2, 3], &[&[8, 0], &[24, 8]], Some(0));
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_unit_axes_go_outermost() {
        let order = compute_order(&[4, 1, 5], &[&[8, 32, 32]], Some(0));
        assert_eq!(order[2], 1);
    }

    #[test]
    fn test_rank_zero() {
        assert!(compute_order(&[], &[&[]], Some(0)).is_empty());
    }
}
