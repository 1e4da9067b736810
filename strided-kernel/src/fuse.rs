//! Dimension fusion ported from Strided.jl/src/mapreduce.jl
//!
//! Dimensions here are in iteration order: index 0 is the innermost loop.

/// Fuse contiguous dimensions across multiple stride sets.
///
/// Dimensions `i-1` and `i` merge when `strides[k][i] == dims[i-1] * strides[k][i-1]`
/// holds for every stride set `k`. The merged extent lands on `i-1`; `i` becomes 1.
pub fn fuse_dims(dims: &[usize], all_strides: &[&[isize]]) -> Vec<usize> {
    let n = dims.len();
    if n <= 1 || all_strides.is_empty() {
        return dims.to_vec();
    }

    let mut result = dims.to_vec();

    for i in (1..n).rev() {
        let can_merge = all_strides
            .iter()
            .all(|strides| strides[i] == result[i - 1] as isize * strides[i - 1]);
        if can_merge {
            result[i - 1] *= result[i];
            result[i] = 1;
        }
    }

    result
}

/// Remove size-1 dimensions from fused dims and all corresponding strides.
///
/// If every dimension is 1, a single dimension of size 1 is kept so the run
/// loop has something to iterate over.
pub fn compress_dims(dims: &[usize], all_strides: &[Vec<isize>]) -> (Vec<usize>, Vec<Vec<isize>>) {
    let kept: Vec<usize> = (0..dims.len()).filter(|&i| dims[i] != 1).collect();

    if kept.is_empty() {
        if dims.is_empty() {
            return (vec![], all_strides.to_vec());
        }
        let new_strides = all_strides.iter().map(|s| vec![s[0]]).collect();
        return (vec![1], new_strides);
    }

    let new_dims: Vec<usize> = kept.iter().map(|&i| dims[i]).collect();
    let new_strides: Vec<Vec<isize>> = all_strides
        .iter()
        .map(|s| kept.iter().map(|&i| s[i]).collect())
        .collect();

    (new_dims, new_strides)
}

/// Compute the "importance" of each dimension for loop ordering.
///
/// An axis's key counts, per stride rank, how many stride sets give it that
/// rank, with the first set (the destination) counted twice. Keys compare
/// lexicographically from rank 1 on, so a smaller stride in any array wins.
pub fn compute_importance(
    dims: &[usize],
    all_strides: &[&[isize]],
    index_orders: &[Vec<usize>],
) -> Vec<Vec<u32>> {
    let n = dims.len();
    let m = all_strides.len();

    if n == 0 || m == 0 {
        return vec![];
    }

    let mut importance = vec![vec![0u32; n]; n];
    for (k, order) in index_orders[..m].iter().enumerate() {
        let weight = if k == 0 { 2 } else { 1 };
        for (key, &o) in importance.iter_mut().zip(order) {
            key[o - 1] += weight;
        }
    }

    // size-1 dimensions go to the back
    for (key, &d) in importance.iter_mut().zip(dims) {
        if d <= 1 {
            key.fill(0);
        }
    }

    importance
}

/// Permutation sorting dimensions by importance, descending. Ties keep their order.
pub fn sort_by_importance<K: Ord>(importance: &[K]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..importance.len()).collect();
    indices.sort_by(|&a, &b| importance[b].cmp(&importance[a]));
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_contiguous() {
        // inner-first order: [3, 4] with strides [1, 3] is one run of 12
        let dims = [3usize, 4];
        let s = [1isize, 3];
        assert_eq!(fuse_dims(&dims, &[&s]), vec![12, 1]);
    }

    #[test]
    fn test_fuse_blocked_by_second_array() {
        let dims = [3usize, 4];
        let a = [1isize, 3];
        let b = [1isize, 4];
        assert_eq!(fuse_dims(&dims, &[&a, &b]), vec![3, 4]);
    }

    #[test]
    fn test_fuse_zero_stride_axes_together() {
        // two reduced axes (stride 0 in the output) fuse, the kept axis does not
        let dims = [2usize, 3, 5];
        let out = [0isize, 0, 8];
        let inp = [8isize, 16, 48];
        assert_eq!(fuse_dims(&dims, &[&out, &inp]), vec![6, 1, 5]);
    }

    #[test]
    fn test_compress_dims() {
        let (d, s) = compress_dims(&[6, 1, 5], &[vec![8, 16, 48], vec![0, 0, 8]]);
        assert_eq!(d, vec![6, 5]);
        assert_eq!(s, vec![vec![8, 48], vec![0, 8]]);
    }

    #[test]
    fn test_compress_all_ones() {
        let (d, s) = compress_dims(&[1, 1], &[vec![8, 8]]);
        assert_eq!(d, vec![1]);
        assert_eq!(s, vec![vec![8]]);
    }

    #[test]
    fn test_importance_size_one_zeroed() {
        let dims = [4usize, 1];
        let s = [8isize, 32];
        let orders = vec![strided_view::index_order(&s)];
        let imp = compute_importance(&dims, &[&s], &orders);
        assert_eq!(imp[0], vec![2, 0]);
        assert_eq!(imp[1], vec![0, 0]);
    }

    #[test]
    fn test_importance_destination_counts_twice() {
        // axis 0 is contiguous in the destination, axis 1 in both inputs
        let dims = [4usize, 5];
        let dst = [8isize, 32];
        let a = [40isize, 8];
        let b = [40isize, 8];
        let sets: [&[isize]; 3] = [&dst, &a, &b];
        let orders: Vec<Vec<usize>> = sets.iter().map(|s| strided_view::index_order(s)).collect();
        let imp = compute_importance(&dims, &sets, &orders);
        assert_eq!(imp[0], vec![2, 2]);
        assert_eq!(imp[1], vec![2, 2]);
        assert_eq!(sort_by_importance(&imp), vec![0, 1]);
    }

    #[test]
    fn test_importance_high_rank() {
        let n = 40;
        let dims = vec![2usize; n];
        let strides: Vec<isize> = (0..n as u32).map(|k| 8 << k).collect();
        let sets: Vec<&[isize]> = vec![strides.as_slice(); 4];
        let orders: Vec<Vec<usize>> = sets.iter().map(|s| strided_view::index_order(s)).collect();
        let imp = compute_importance(&dims, &sets, &orders);
        let order = sort_by_importance(&imp);
        assert_eq!(order, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_by_importance_stable() {
        assert_eq!(sort_by_importance(&[1, 5, 5, 0]), vec![1, 2, 0, 3]);
    }
}
