//! Dynamically typed strided arrays over shared storage.
//!
//! A [`StridedArray`] is a handle: cloning it takes an additional reference to
//! the same storage (and the same NA mask storage), so writes through one
//! handle are visible through every alias. Views produced by
//! [`StridedArray::offset_view`], [`StridedArray::broadcast_to`] and friends
//! are new handles; the source handle is never mutated.
//!
//! Because aliases write through shared storage without synchronisation,
//! handles are neither `Send` nor `Sync`:
//!
//! ```compile_fail
//! fn share<T: Sync>(_: &T) {}
//! let a = strided_view::StridedArray::zeros(strided_view::DType::F64, &[2]).unwrap();
//! share(&a);
//! ```

use std::rc::Rc;

use crate::auxiliary::{next_index, row_major_byte_strides, sorted_stride_perm};
use crate::buffer::Buffer;
use crate::dtype::{DType, Element};
use crate::{Result, StridedError};

/// Mask byte of an exposed (available) element.
pub const MASK_EXPOSED: u8 = 1;
/// Mask byte of a hidden (NA) element.
pub const MASK_HIDDEN: u8 = 0;

/// An element is exposed iff the low bit of its mask byte is set.
#[inline]
pub fn is_exposed(mask_value: u8) -> bool {
    mask_value & 1 != 0
}

/// Interpretation of the mask bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaskKind {
    /// Plain 0/1 bytes.
    #[default]
    Bool,
    /// Bytes carry a payload in the high bits (several NA kinds).
    Multi,
}

// ============================================================================
// Validation helpers
// ============================================================================

/// Validate that every element touched by the layout lies within `[0, len)`.
fn validate_bounds(
    len: usize,
    dims: &[usize],
    strides: &[isize],
    offset: isize,
    itemsize: usize,
) -> Result<()> {
    if dims.len() != strides.len() {
        return Err(StridedError::StrideLengthMismatch);
    }
    if dims.iter().any(|&d| d == 0) {
        return Ok(());
    }
    let (min_offset, max_offset) = byte_extent(dims, strides, offset)?;
    if min_offset < 0 {
        return Err(StridedError::OffsetOverflow);
    }
    let end = (max_offset as usize)
        .checked_add(itemsize)
        .ok_or(StridedError::OffsetOverflow)?;
    if end > len {
        return Err(StridedError::OffsetOverflow);
    }
    Ok(())
}

/// Lowest and highest element start offsets reachable by a layout.
fn byte_extent(dims: &[usize], strides: &[isize], offset: isize) -> Result<(isize, isize)> {
    let mut min_offset = offset;
    let mut max_offset = offset;
    for (&dim, &stride) in dims.iter().zip(strides.iter()) {
        if dim > 1 {
            let end = stride
                .checked_mul(dim as isize - 1)
                .ok_or(StridedError::OffsetOverflow)?;
            if end >= 0 {
                max_offset = max_offset
                    .checked_add(end)
                    .ok_or(StridedError::OffsetOverflow)?;
            } else {
                min_offset = min_offset
                    .checked_add(end)
                    .ok_or(StridedError::OffsetOverflow)?;
            }
        }
    }
    Ok((min_offset, max_offset))
}

fn checked_len(dims: &[usize]) -> Result<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or(StridedError::AllocationTooLarge(usize::MAX))
    })
}

fn allocation_bytes(dims: &[usize], itemsize: usize) -> Result<usize> {
    let len = checked_len(dims)?;
    len.checked_mul(itemsize)
        .ok_or(StridedError::AllocationTooLarge(usize::MAX))
}

/// Contiguous strides laid out following `perm` (outermost first).
fn strides_for_perm(dims: &[usize], perm: &[usize], itemsize: usize) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut stride = itemsize as isize;
    for &axis in perm.iter().rev() {
        strides[axis] = stride;
        stride *= dims[axis].max(1) as isize;
    }
    strides
}

// ============================================================================
// NaMask
// ============================================================================

/// Byte-per-element exposure mask attached to a [`StridedArray`].
#[derive(Clone, Debug)]
pub struct NaMask {
    buf: Rc<Buffer>,
    kind: MaskKind,
    strides: Rc<[isize]>,
    offset: isize,
}

impl NaMask {
    #[inline]
    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    /// Byte strides of the mask, one per array axis.
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    #[inline]
    pub fn offset(&self) -> isize {
        self.offset
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.buf.as_ptr().wrapping_offset(self.offset)
    }

    fn byte_at(&self, idx: &[usize]) -> *mut u8 {
        let off: isize = idx
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &s)| i as isize * s)
            .sum();
        self.ptr().wrapping_offset(off)
    }
}

// ============================================================================
// StridedArray
// ============================================================================

/// Dynamic-rank, dynamically typed strided array handle.
///
/// Strides and offsets are in bytes. The optional [`NaMask`] has its own
/// strides over its own storage; the optional tag names a caller-defined
/// array subtype and is carried along by [`StridedArray::clone`].
#[derive(Clone, Debug)]
pub struct StridedArray {
    buf: Rc<Buffer>,
    dtype: DType,
    dims: Rc<[usize]>,
    strides: Rc<[isize]>,
    offset: isize,
    mask: Option<NaMask>,
    tag: Option<Rc<str>>,
}

impl StridedArray {
    /// Allocate a zero-filled, row-major array.
    pub fn zeros(dtype: DType, dims: &[usize]) -> Result<Self> {
        let strides = row_major_byte_strides(dims, dtype.itemsize());
        Self::with_layout(dtype, dims, &strides)
    }

    /// Allocate a zero-filled array with explicit byte strides.
    ///
    /// The storage is sized to hold every element the layout can reach;
    /// negative strides are supported by starting at a positive offset.
    pub fn with_layout(dtype: DType, dims: &[usize], strides: &[isize]) -> Result<Self> {
        if dims.len() != strides.len() {
            return Err(StridedError::StrideLengthMismatch);
        }
        let itemsize = dtype.itemsize();
        let (bytes, offset) = if dims.iter().any(|&d| d == 0) {
            (0, 0)
        } else {
            let (min, max) = byte_extent(dims, strides, 0)?;
            let span = (max - min) as usize + itemsize;
            (span, -min)
        };
        let buf = Rc::new(Buffer::zeroed(bytes)?);
        Self::from_parts(buf, dtype, dims, strides, offset)
    }

    /// Wrap existing storage. The layout must stay within the buffer.
    pub fn from_parts(
        buf: Rc<Buffer>,
        dtype: DType,
        dims: &[usize],
        strides: &[isize],
        offset: isize,
    ) -> Result<Self> {
        validate_bounds(buf.len(), dims, strides, offset, dtype.itemsize())?;
        Ok(Self {
            buf,
            dtype,
            dims: Rc::from(dims),
            strides: Rc::from(strides),
            offset,
            mask: None,
            tag: None,
        })
    }

    /// Build a row-major array from values given in C order.
    pub fn from_vec<T: Element>(dims: &[usize], data: Vec<T>) -> Result<Self> {
        let expected = checked_len(dims)?;
        if data.len() != expected {
            return Err(StridedError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }
        let arr = Self::zeros(T::dtype(), dims)?;
        let dst = arr.buf.as_ptr() as *mut T;
        for (i, v) in data.into_iter().enumerate() {
            unsafe { dst.add(i).write_unaligned(v) };
        }
        Ok(arr)
    }

    /// Build a row-major array by evaluating `f` at every multi-index.
    pub fn from_fn_row_major<T: Element, F>(dims: &[usize], mut f: F) -> Result<Self>
    where
        F: FnMut(&[usize]) -> T,
    {
        let arr = Self::zeros(T::dtype(), dims)?;
        arr.for_each_index(|idx| arr.write_at(idx, f(idx)));
        Ok(arr)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Byte strides.
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Byte offset of the first element inside the storage.
    #[inline]
    pub fn offset(&self) -> isize {
        self.offset
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    #[inline]
    pub fn itemsize(&self) -> usize {
        self.dtype.itemsize()
    }

    /// Pointer to the first element.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.buf.as_ptr().wrapping_offset(self.offset)
    }

    /// Whether the first element and every stride honour the dtype alignment.
    pub fn is_aligned(&self) -> bool {
        let align = self.dtype.alignment();
        self.ptr() as usize % align == 0
            && self
                .dims
                .iter()
                .zip(self.strides.iter())
                .all(|(&d, &s)| d <= 1 || s.unsigned_abs() % align == 0)
    }

    /// Whether both handles share data storage.
    #[inline]
    pub fn shares_storage(&self, other: &StridedArray) -> bool {
        Rc::ptr_eq(&self.buf, &other.buf)
    }

    #[inline]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Set or clear the subtype tag of this handle.
    pub fn with_tag(mut self, tag: Option<&str>) -> Self {
        self.tag = tag.map(Rc::from);
        self
    }

    // ------------------------------------------------------------------
    // Typed element access
    // ------------------------------------------------------------------

    fn byte_offset(&self, idx: &[usize]) -> isize {
        assert_eq!(idx.len(), self.ndim(), "index rank mismatch");
        idx.iter()
            .zip(self.dims.iter().zip(self.strides.iter()))
            .map(|(&i, (&d, &s))| {
                assert!(i < d, "index {i} out of bounds for extent {d}");
                i as isize * s
            })
            .sum()
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype != T::dtype() {
            return Err(StridedError::DTypeMismatch {
                expected: self.dtype.clone(),
                found: T::dtype(),
            });
        }
        Ok(())
    }

    fn read_at<T: Element>(&self, idx: &[usize]) -> T {
        let p = self.ptr().wrapping_offset(self.byte_offset(idx));
        unsafe { (p as *const T).read_unaligned() }
    }

    fn write_at<T: Element>(&self, idx: &[usize], value: T) {
        let p = self.ptr().wrapping_offset(self.byte_offset(idx));
        unsafe { (p as *mut T).write_unaligned(value) }
    }

    fn for_each_index<F: FnMut(&[usize])>(&self, mut f: F) {
        if self.is_empty() {
            return;
        }
        let mut idx = vec![0usize; self.ndim()];
        loop {
            f(&idx);
            if !next_index(&mut idx, &self.dims) {
                break;
            }
        }
    }

    /// Read the element at `idx`.
    ///
    /// # Panics
    /// Panics if `T` does not match the dtype or `idx` is out of bounds.
    pub fn get<T: Element>(&self, idx: &[usize]) -> T {
        assert_eq!(self.dtype, T::dtype(), "dtype mismatch");
        self.read_at(idx)
    }

    /// Write the element at `idx`; visible through every alias.
    ///
    /// # Panics
    /// Panics if `T` does not match the dtype or `idx` is out of bounds.
    pub fn set<T: Element>(&self, idx: &[usize], value: T) {
        assert_eq!(self.dtype, T::dtype(), "dtype mismatch");
        self.write_at(idx, value)
    }

    /// All elements in C order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let mut out = Vec::with_capacity(self.len());
        self.for_each_index(|idx| out.push(self.read_at(idx)));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // NA mask
    // ------------------------------------------------------------------

    #[inline]
    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    #[inline]
    pub fn mask(&self) -> Option<&NaMask> {
        self.mask.as_ref()
    }

    /// Pointer to the mask byte of the first element.
    #[inline]
    pub fn mask_ptr(&self) -> Option<*mut u8> {
        self.mask.as_ref().map(NaMask::ptr)
    }

    #[inline]
    pub fn mask_strides(&self) -> Option<&[isize]> {
        self.mask.as_ref().map(NaMask::strides)
    }

    /// Mask layout for this array: contiguous in the data's stride order with
    /// zero stride only on unit axes. Broadcast axes get their own bytes, so
    /// elements sharing data never share exposure.
    fn fresh_mask_strides(&self) -> Vec<isize> {
        let perm = sorted_stride_perm(&self.strides);
        let mut strides = strides_for_perm(&self.dims, &perm, 1);
        for (s, &d) in strides.iter_mut().zip(self.dims.iter()) {
            if d <= 1 {
                *s = 0;
            }
        }
        strides
    }

    fn fresh_mask(&self, kind: MaskKind, fill: u8) -> Result<NaMask> {
        let strides = self.fresh_mask_strides();
        let bytes = if self.is_empty() {
            0
        } else {
            let (_, max) = byte_extent(&self.dims, &strides, 0)?;
            max as usize + 1
        };
        Ok(NaMask {
            buf: Rc::new(Buffer::filled(bytes, fill)?),
            kind,
            strides: Rc::from(strides),
            offset: 0,
        })
    }

    /// Attach a freshly allocated boolean mask, every slot set to `exposed`.
    pub fn attach_mask(&mut self, exposed: bool) -> Result<()> {
        let fill = if exposed { MASK_EXPOSED } else { MASK_HIDDEN };
        self.mask = Some(self.fresh_mask(MaskKind::Bool, fill)?);
        Ok(())
    }

    /// Attach a fresh boolean mask from exposure flags given in C order.
    pub fn with_mask_values(mut self, exposed: &[bool]) -> Result<Self> {
        if exposed.len() != self.len() {
            return Err(StridedError::LengthMismatch {
                expected: self.len(),
                found: exposed.len(),
            });
        }
        self.attach_mask(true)?;
        let mut values = exposed.iter();
        let mut result = Ok(());
        self.for_each_index(|idx| {
            if let Some(&e) = values.next() {
                if let Err(err) = self.set_exposed(idx, e) {
                    result = Err(err);
                }
            }
        });
        result.map(|_| self)
    }

    /// Relabel the mask interpretation.
    pub fn with_mask_kind(mut self, kind: MaskKind) -> Result<Self> {
        let mask = self.mask.as_mut().ok_or(StridedError::MissingMask)?;
        mask.kind = kind;
        Ok(self)
    }

    /// Whether the element at `idx` is exposed. Unmasked arrays are fully exposed.
    pub fn is_exposed(&self, idx: &[usize]) -> bool {
        match &self.mask {
            Some(mask) => {
                self.byte_offset(idx);
                is_exposed(unsafe { *mask.byte_at(idx) })
            }
            None => true,
        }
    }

    /// Expose or hide the element at `idx`.
    pub fn set_exposed(&self, idx: &[usize], exposed: bool) -> Result<()> {
        let mask = self.mask.as_ref().ok_or(StridedError::MissingMask)?;
        self.byte_offset(idx);
        let v = if exposed { MASK_EXPOSED } else { MASK_HIDDEN };
        unsafe { *mask.byte_at(idx) = v };
        Ok(())
    }

    /// Set every mask slot of this view.
    pub fn fill_mask(&self, exposed: bool) -> Result<()> {
        let mask = self.mask.as_ref().ok_or(StridedError::MissingMask)?;
        let v = if exposed { MASK_EXPOSED } else { MASK_HIDDEN };
        self.for_each_index(|idx| unsafe { *mask.byte_at(idx) = v });
        Ok(())
    }

    /// Exposure flags in C order, or `None` without a mask.
    pub fn mask_values(&self) -> Option<Vec<bool>> {
        let mask = self.mask.as_ref()?;
        let mut out = Vec::with_capacity(self.len());
        self.for_each_index(|idx| out.push(is_exposed(unsafe { *mask.byte_at(idx) })));
        Some(out)
    }

    /// Handle on the same data that ignores the mask.
    pub fn without_mask(&self) -> Self {
        let mut view = self.clone();
        view.mask = None;
        view
    }

    /// Handle sharing the data but owning a private copy of the mask.
    ///
    /// Mask payload bytes are copied verbatim, so multi-valued masks keep
    /// their payload.
    pub fn with_owned_mask_copy(&self) -> Result<Self> {
        let src = self.mask.as_ref().ok_or(StridedError::MissingMask)?;
        let mask = self.fresh_mask(src.kind, MASK_HIDDEN)?;
        self.for_each_index(|idx| unsafe { *mask.byte_at(idx) = *src.byte_at(idx) });
        let mut view = self.clone();
        view.mask = Some(mask);
        Ok(view)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// General aliasing view with new geometry over the same storage.
    ///
    /// `mask_strides` must be given iff the array has a mask.
    pub fn with_geometry(
        &self,
        dims: &[usize],
        strides: &[isize],
        mask_strides: Option<&[isize]>,
    ) -> Result<Self> {
        validate_bounds(self.buf.len(), dims, strides, self.offset, self.itemsize())?;
        let mask = match (&self.mask, mask_strides) {
            (Some(mask), Some(ms)) => {
                validate_bounds(mask.buf.len(), dims, ms, mask.offset, 1)?;
                Some(NaMask {
                    strides: Rc::from(ms),
                    ..mask.clone()
                })
            }
            (None, None) => None,
            (Some(_), None) => return Err(StridedError::StrideLengthMismatch),
            (None, Some(_)) => return Err(StridedError::MissingMask),
        };
        Ok(Self {
            dims: Rc::from(dims),
            strides: Rc::from(strides),
            mask,
            ..self.clone()
        })
    }

    /// Broadcast extent-1 axes to `dims` (stride 0 on broadcast axes).
    pub fn broadcast_to(&self, dims: &[usize]) -> Result<Self> {
        if dims.len() != self.ndim() {
            return Err(StridedError::RankMismatch(self.ndim(), dims.len()));
        }
        let broadcast = |strides: &[isize]| -> Result<Vec<isize>> {
            self.dims
                .iter()
                .zip(dims)
                .zip(strides)
                .map(|((&have, &want), &s)| {
                    if have == want {
                        Ok(s)
                    } else if have == 1 {
                        Ok(0)
                    } else {
                        Err(StridedError::ShapeMismatch(
                            self.dims.to_vec(),
                            dims.to_vec(),
                        ))
                    }
                })
                .collect()
        };
        let strides = broadcast(&self.strides)?;
        let mask_strides = match self.mask_strides() {
            Some(ms) => Some(broadcast(ms)?),
            None => None,
        };
        self.with_geometry(dims, &strides, mask_strides.as_deref())
    }

    /// Drop the flagged axes. Flagged axes must have extent 1.
    pub fn remove_axes(&self, flags: &[bool]) -> Result<Self> {
        if flags.len() != self.ndim() {
            return Err(StridedError::RankMismatch(self.ndim(), flags.len()));
        }
        if let Some(axis) = (0..flags.len()).find(|&i| flags[i] && self.dims[i] != 1) {
            return Err(StridedError::InvalidAxis {
                axis,
                rank: self.ndim(),
            });
        }
        let keep = |v: &[isize]| -> Vec<isize> {
            v.iter()
                .zip(flags)
                .filter(|(_, &f)| !f)
                .map(|(&s, _)| s)
                .collect()
        };
        let dims: Vec<usize> = self
            .dims
            .iter()
            .zip(flags)
            .filter(|(_, &f)| !f)
            .map(|(&d, _)| d)
            .collect();
        let mask_strides = self.mask_strides().map(keep);
        self.with_geometry(&dims, &keep(&self.strides), mask_strides.as_deref())
    }

    /// View of the box `[starts, starts + extents)`; data and mask offsets
    /// advance together.
    pub fn offset_view(&self, starts: &[usize], extents: &[usize]) -> Result<Self> {
        let rank = self.ndim();
        if starts.len() != rank || extents.len() != rank {
            return Err(StridedError::RankMismatch(rank, starts.len().max(extents.len())));
        }
        for (axis, ((&s, &e), &d)) in starts.iter().zip(extents).zip(self.dims.iter()).enumerate()
        {
            if s.checked_add(e).map_or(true, |end| end > d) {
                return Err(StridedError::InvalidAxis { axis, rank });
            }
        }
        let shift = |strides: &[isize]| -> isize {
            starts
                .iter()
                .zip(extents)
                .zip(strides)
                .filter(|((_, &e), _)| e > 0)
                .map(|((&s, _), &st)| s as isize * st)
                .sum()
        };
        let mut view = self.clone();
        if extents.iter().all(|&e| e > 0) {
            view.offset += shift(&self.strides);
            if let Some(mask) = view.mask.as_mut() {
                mask.offset += shift(&mask.strides);
            }
        }
        view.dims = Rc::from(extents);
        Ok(view)
    }
}
