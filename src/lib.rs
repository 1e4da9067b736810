//! Generic axis reductions over strided arrays with NA exposure masks.
//!
//! The engine reduces an n-dimensional [`StridedArray`] along a chosen set of
//! axes with caller-supplied inner loops, handling elements hidden by an NA
//! mask. It is the shared driver behind per-operation entry points such as
//! sum, max or mean, which choose the axes, the casting policy and the loops.
//!
//! # Components
//!
//! - [`allocate_reduce_result`], [`conform_reduce_result`],
//!   [`create_reduce_result`]: build or validate the result container
//! - [`seed_reduce_result`]: seed results of reductions without an identity
//! - [`reduce`]: wire the loops to a broadcasting [`NdIter`]
//! - [`count_reduce_items`]: per-slot counts of exposed elements (mean, var)
//!
//! # Example
//!
//! ```rust
//! use strided_reduce::{reduce, NdIter, ReduceConfig, ReduceLoops, StridedArray, DType};
//!
//! let a = StridedArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! let config = ReduceConfig::new("sum", DType::F64, DType::F64).keepdims(true);
//!
//! let sum = |iter: &mut NdIter, _skip: usize| -> strided_reduce::Result<()> {
//!     loop {
//!         for i in 0..iter.inner_len() {
//!             let acc: f64 = iter.read(0, i);
//!             let x: f64 = iter.read(1, i);
//!             iter.write(0, i, acc + x);
//!         }
//!         if !iter.advance()? {
//!             return Ok(());
//!         }
//!     }
//! };
//! let mut identity = |result: &StridedArray, preserve_na: bool| -> strided_reduce::Result<()> {
//!     Ok(strided_reduce::assign_scalar(result, 0.0f64, preserve_na)?)
//! };
//!
//! let loops = ReduceLoops::new().plain(sum);
//! let out = reduce(&a, None, &[false, true], config, Some(&mut identity), loops).unwrap();
//! assert_eq!(out.dims(), &[2, 1]);
//! assert_eq!(out.to_vec::<f64>().unwrap(), vec![6.0, 15.0]);
//! ```

pub mod count;
pub mod dispatch;
pub mod na;
pub mod result;
pub mod seed;

pub use count::{count_reduce_items, ReducedCount};
pub use dispatch::{reduce, AssignIdentity, LoopStrategy, ReduceConfig, ReduceLoop, ReduceLoops};
pub use na::{contains_na, reduce_mask_into};
pub use result::{allocate_reduce_result, conform_reduce_result, create_reduce_result};
pub use seed::{check_nonreorderable_axes, seed_reduce_result, Seeded};

pub use strided_kernel::{
    assign_array, assign_scalar, Access, IterConfig, IterOperand, MaskUse, NdIter,
    DEFAULT_BUFFER_SIZE,
};
pub use strided_view::{
    Casting, DType, Element, MaskKind, StridedArray, StridedError, BUFFER_ALIGN,
};

/// Errors reported by the reduction engine.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("reduce operations do not yet support a where mask")]
    WhereMaskUnsupported,

    #[error("multi-NA support is not yet implemented in reduce operations")]
    SkipWhichNaUnsupported,

    #[error("expected {expected} axis flags, got {found}")]
    AxisFlagCount { expected: usize, found: usize },

    #[error(
        "output parameter for reduction operation {name} has the wrong number of dimensions \
         (must match the operand's when keepdims=True)"
    )]
    KeepdimsRankMismatch { name: String },

    #[error(
        "output parameter for reduction operation {name} has a reduction dimension not equal \
         to one (required when keepdims=True)"
    )]
    KeepdimsExtentNotOne { name: String },

    #[error("output parameter for reduction operation {name} does not have enough dimensions")]
    NotEnoughDimensions { name: String },

    #[error("output parameter for reduction operation {name} has too many dimensions")]
    TooManyDimensions { name: String },

    #[error(
        "output parameter for reduction operation {name} needs an NA mask, but the array \
         provided does not have one"
    )]
    OutputNeedsMask { name: String },

    #[error("reduction operation '{name}' is not reorderable, so only one axis may be specified")]
    NotReorderable { name: String },

    #[error("zero-size array to reduction operation {name} which has no identity")]
    EmptyNoIdentity { name: String },

    #[error("fully NA array with skipna=True to reduction operation {name} which has no identity")]
    AllNaNoIdentity { name: String },

    #[error(
        "reduction operation {name} with skipna=True had an output element with all its inputs NA"
    )]
    AllNaOutputElement { name: String },

    #[error("cannot assign NA to an array which does not support NAs")]
    NaToUnmaskedOutput,

    #[error("reduction operation {name} did not supply an unmasked inner loop function")]
    MissingUnmaskedLoop { name: String },

    #[error("reduction operation {name} did not supply a masked inner loop function")]
    MissingMaskedLoop { name: String },

    #[error("field-NA isn't implemented yet")]
    FieldNaUnsupported,

    #[error("multi-NA isn't implemented yet")]
    MultiNaUnsupported,

    /// Failure reported by an inner loop or identity callback.
    #[error("{0}")]
    Kernel(String),

    #[error(transparent)]
    Strided(#[from] StridedError),
}

/// Result type for reduction operations.
pub type Result<T> = std::result::Result<T, ReduceError>;

/// Check that `axis_flags` has one flag per axis of a rank-`ndim` operand.
pub(crate) fn check_axis_flags(ndim: usize, axis_flags: &[bool]) -> Result<()> {
    if axis_flags.len() != ndim {
        return Err(ReduceError::AxisFlagCount {
            expected: ndim,
            found: axis_flags.len(),
        });
    }
    Ok(())
}
