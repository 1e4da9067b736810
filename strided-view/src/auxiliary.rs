//! Stride bookkeeping shared by allocation and loop planning.

/// Compute the relative order of strides.
///
/// Returns a vector where `result[i]` is the rank of `strides[i]` among all non-zero strides.
/// Zero strides have order 1.
pub fn index_order(strides: &[isize]) -> Vec<usize> {
    strides
        .iter()
        .map(|&si| {
            let si = si.unsigned_abs();
            if si == 0 {
                return 1;
            }
            1 + strides
                .iter()
                .filter(|&&s| s != 0 && s.unsigned_abs() < si)
                .count()
        })
        .collect()
}

/// Axis permutation sorted by decreasing stride magnitude.
///
/// The sort is stable, so axes with equal strides keep their C order; zero
/// (broadcast) strides end up innermost.
pub fn sorted_stride_perm(strides: &[isize]) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..strides.len()).collect();
    perm.sort_by(|&a, &b| strides[b].unsigned_abs().cmp(&strides[a].unsigned_abs()));
    perm
}

/// C-order byte strides for a contiguous array of `itemsize`-byte elements.
pub fn row_major_byte_strides(dims: &[usize], itemsize: usize) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut stride = itemsize as isize;
    for (s, &d) in strides.iter_mut().zip(dims).rev() {
        *s = stride;
        stride *= d.max(1) as isize;
    }
    strides
}

/// Advance a C-order multi-index; returns `false` once it wraps around.
pub(crate) fn next_index(idx: &mut [usize], dims: &[usize]) -> bool {
    for d in (0..dims.len()).rev() {
        idx[d] += 1;
        if idx[d] < dims[d] {
            return true;
        }
        idx[d] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_order() {
        // strides [4, 1, 2]: 4 is largest, 1 is smallest, 2 is middle
        assert_eq!(index_order(&[4, 1, 2]), vec![3, 1, 2]);
    }

    #[test]
    fn test_index_order_with_zero() {
        assert_eq!(index_order(&[4, 0, 2]), vec![2, 1, 1]);
    }

    #[test]
    fn test_index_order_negative_and_tied() {
        assert_eq!(index_order(&[-4, 1, -2]), vec![3, 1, 2]);
        assert_eq!(index_order(&[2, 2, 1]), vec![2, 2, 1]);
    }

    #[test]
    fn test_sorted_stride_perm() {
        assert_eq!(sorted_stride_perm(&[24, 8]), vec![0, 1]);
        assert_eq!(sorted_stride_perm(&[8, 16, 48]), vec![2, 1, 0]);
        // ties keep C order, zero strides go last
        assert_eq!(sorted_stride_perm(&[0, 8, 8]), vec![1, 2, 0]);
    }

    #[test]
    fn test_row_major_byte_strides() {
        assert_eq!(row_major_byte_strides(&[2, 3, 4], 8), vec![96, 32, 8]);
        assert_eq!(row_major_byte_strides(&[], 8), Vec::<isize>::new());
        assert_eq!(row_major_byte_strides(&[0, 3], 4), vec![12, 4]);
    }

    #[test]
    fn test_next_index_c_order() {
        let dims = [2, 2];
        let mut idx = vec![0, 0];
        let mut seen = vec![idx.clone()];
        while next_index(&mut idx, &dims) {
            seen.push(idx.clone());
        }
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
    }
}
