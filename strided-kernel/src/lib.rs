//! Iteration and element transfer machinery for dynamically typed strided arrays.
//!
//! - [`build_plan`] / [`for_each_run`]: Strided.jl-style loop ordering and
//!   dimension fusion, walking innermost runs of several arrays at once
//! - [`NdIter`]: multi-operand run iterator with broadcasting, reduce
//!   operands, buffering/casting and NA mask streams
//! - [`cast_strided`], [`assign_array`], [`assign_scalar`]: element copy/cast
//!
//! Run callbacks only see plain memory (offsets, lengths and strides) and
//! never call back into user code.

pub mod fuse;
pub mod iter;
pub mod kernel;
mod order;
pub mod transfer;

pub use iter::{Access, IterConfig, IterOperand, MaskUse, NdIter};
pub use kernel::{build_plan, for_each_planned_run, for_each_run, total_len, LoopPlan};
pub use strided_view::{Result, StridedError};
pub use transfer::{assign_array, assign_scalar, cast_strided};

/// Default run length, in elements, of buffered iteration.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
