//! Run planning and the unbuffered run walker.
//!
//! Planning orders the axes, fuses contiguous ones and drops unit extents.
//! There is no blocking: each callback receives one full innermost run.

use crate::fuse::{compress_dims, fuse_dims};
use crate::order;

/// Loop nest in iteration order: index 0 is the innermost dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopPlan {
    pub dims: Vec<usize>,
    /// One stride vector per stride set, aligned with `dims`.
    pub strides: Vec<Vec<isize>>,
}

impl LoopPlan {
    /// Number of elements visited.
    #[inline]
    pub fn len(&self) -> usize {
        total_len(&self.dims)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[inline]
pub fn total_len(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Build an iteration plan for arrays sharing `dims`.
///
/// Pipeline: order -> reorder -> fuse -> compress.
///
/// Ordering first sorts dimensions by stride importance (smallest stride
/// innermost). Fusing after ordering catches contiguous dimensions whatever
/// the original memory layout. Rank-0 input yields a single dimension of
/// extent 1 so that there is always one run.
pub fn build_plan(dims: &[usize], strides_list: &[&[isize]], dest_index: Option<usize>) -> LoopPlan {
    if dims.is_empty() {
        return LoopPlan {
            dims: vec![1],
            strides: vec![vec![0]; strides_list.len()],
        };
    }

    let order = order::compute_order(dims, strides_list, dest_index);

    let ordered_dims: Vec<usize> = order.iter().map(|&d| dims[d]).collect();
    let ordered_strides: Vec<Vec<isize>> = strides_list
        .iter()
        .map(|strides| order.iter().map(|&d| strides[d]).collect())
        .collect();
    let ordered_strides_refs: Vec<&[isize]> =
        ordered_strides.iter().map(|s| s.as_slice()).collect();

    let fused_dims = fuse_dims(&ordered_dims, &ordered_strides_refs);
    let (dims, strides) = compress_dims(&fused_dims, &ordered_strides);

    LoopPlan { dims, strides }
}

/// Walk every innermost run of a plan.
///
/// The callback receives the byte offset of the run start for each stride
/// set, the run length, and the innermost stride of each stride set. Outer
/// dimensions advance with a carry-style odometer, so each dimension is
/// visited in increasing index order.
pub fn for_each_planned_run<E, F>(plan: &LoopPlan, mut f: F) -> Result<(), E>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<(), E>,
{
    let rank = plan.dims.len();
    let strides = &plan.strides;
    if plan.is_empty() {
        return Ok(());
    }

    let d0 = plan.dims[0];
    let inner_strides: Vec<isize> = strides.iter().map(|s| s[0]).collect();
    let mut offsets = vec![0isize; strides.len()];
    let mut idx = vec![0usize; rank];

    loop {
        f(&offsets, d0, &inner_strides)?;

        // Carry-style increment for outer levels.
        let mut level = 1usize;
        loop {
            if level == rank {
                return Ok(());
            }
            for (offset, s) in offsets.iter_mut().zip(strides.iter()) {
                *offset += s[level];
            }
            idx[level] += 1;
            if idx[level] < plan.dims[level] {
                break;
            }

            idx[level] = 0;
            for (offset, s) in offsets.iter_mut().zip(strides.iter()) {
                *offset -= (plan.dims[level] as isize) * s[level];
            }
            level += 1;
        }
    }
}

/// Plan and walk in one step; see [`build_plan`] and [`for_each_planned_run`].
pub fn for_each_run<E, F>(
    dims: &[usize],
    strides_list: &[&[isize]],
    dest_index: Option<usize>,
    f: F,
) -> Result<(), E>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<(), E>,
{
    let plan = build_plan(dims, strides_list, dest_index);
    log::trace!("run plan: dims={:?} strides={:?}", plan.dims, plan.strides);
    for_each_planned_run(&plan, f)
}
