//! Dynamically typed strided array views with NA exposure masks.
//!
//! This crate is the data-model layer of the workspace:
//!
//! - [`DType`] / [`Element`]: runtime element descriptors and the Rust
//!   primitives that map onto them
//! - [`Casting`] / [`can_cast`]: casting policy between descriptors
//! - [`StridedArray`]: a cheap-to-clone handle over shared byte storage with
//!   byte strides, an optional [`NaMask`] and an optional subtype tag
//!
//! # Dependency graph
//!
//! ```text
//! strided-view -> strided-kernel -> strided-reduce
//! ```

pub mod array;
pub mod auxiliary;
mod buffer;
pub mod dtype;

pub use array::{is_exposed, MaskKind, NaMask, StridedArray, MASK_EXPOSED, MASK_HIDDEN};
pub use auxiliary::{index_order, row_major_byte_strides, sorted_stride_perm};
pub use buffer::{Buffer, BUFFER_ALIGN};
pub use dtype::{can_cast, Casting, DType, DTypeKind, Element, Field};

/// Errors that can occur while building or accessing strided arrays.
#[derive(Debug, thiserror::Error)]
pub enum StridedError {
    /// Array ranks do not match.
    #[error("rank mismatch: {0} vs {1}")]
    RankMismatch(usize, usize),

    /// Array shapes are incompatible for the operation.
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    /// Invalid axis index for the given array rank.
    #[error("invalid axis {axis} for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    /// Stride array length doesn't match dimensions.
    #[error("stride and dims length mismatch")]
    StrideLengthMismatch,

    /// A view would reach outside of its storage.
    #[error("offset overflow while computing pointer")]
    OffsetOverflow,

    /// Typed access with a Rust type that does not match the array's descriptor.
    #[error("dtype mismatch: expected {expected:?}, found {found:?}")]
    DTypeMismatch { expected: DType, found: DType },

    /// Number of values supplied doesn't match the number of elements.
    #[error("length mismatch: expected {expected} values, got {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// The casting policy forbids converting between two descriptors.
    #[error("cannot cast from {from:?} to {to:?} under {casting:?} casting")]
    CastNotAllowed {
        from: DType,
        to: DType,
        casting: Casting,
    },

    /// An operand needs a buffered copy but buffering was not enabled.
    #[error("operand {0} requires buffering, which is not enabled")]
    BufferingRequired(usize),

    /// The array has no NA mask but the operation needs one.
    #[error("array has no NA mask")]
    MissingMask,

    /// Requested allocation size does not fit the address space.
    #[error("allocation of {0} bytes is too large")]
    AllocationTooLarge(usize),
}

/// Result type for strided array operations.
pub type Result<T> = std::result::Result<T, StridedError>;
