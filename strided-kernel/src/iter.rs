//! Multi-operand run iterator with broadcasting, reduce operands, optional
//! buffering/casting and NA mask streams.
//!
//! The iterator hands out one innermost run at a time. Callers read the
//! per-stream data pointers and inner strides, process [`NdIter::inner_len`]
//! elements, and call [`NdIter::advance`] until it returns `false`.
//!
//! Streams are numbered data operands first (in operand order), followed by
//! one mask stream per operand opened with [`MaskUse::Use`].

use strided_view::{
    can_cast, is_exposed, Buffer, Casting, DType, Element, StridedArray, StridedError,
    MASK_EXPOSED, MASK_HIDDEN,
};

use crate::kernel::{build_plan, total_len};
use crate::transfer::cast_strided;
use crate::{Result, DEFAULT_BUFFER_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Whether the iterator exposes an operand's NA mask as a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaskUse {
    #[default]
    Ignore,
    Use,
}

/// One array taking part in an iteration.
#[derive(Clone, Debug)]
pub struct IterOperand {
    pub array: StridedArray,
    pub access: Access,
    pub mask: MaskUse,
    /// Element type the caller wants to see; `None` keeps the array's.
    pub dtype: Option<DType>,
}

impl IterOperand {
    pub fn read_only(array: StridedArray) -> Self {
        Self {
            array,
            access: Access::ReadOnly,
            mask: MaskUse::Ignore,
            dtype: None,
        }
    }

    pub fn read_write(array: StridedArray) -> Self {
        Self {
            access: Access::ReadWrite,
            ..Self::read_only(array)
        }
    }

    pub fn mask_use(mut self, mask: MaskUse) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }
}

/// Iterator-wide options.
#[derive(Clone, Copy, Debug)]
pub struct IterConfig {
    /// Policy for converting operands to their requested dtype.
    pub casting: Casting,
    /// Maximum run length, in elements, while any operand is buffered.
    pub buffer_size: usize,
    /// Allow private buffers for operands that need a cast or alignment.
    pub buffered: bool,
    /// Require aligned data pointers (misaligned operands get buffered).
    pub aligned: bool,
}

impl Default for IterConfig {
    fn default() -> Self {
        Self {
            casting: Casting::SameKind,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffered: false,
            aligned: false,
        }
    }
}

struct StreamBuffer {
    buf: Buffer,
    dtype: DType,
    /// Inner stride is 0: one buffered element serves the whole run.
    single: bool,
}

struct Stream {
    /// Pointer to the element at coordinate 0.
    base: *mut u8,
    /// Byte strides in plan order.
    strides: Vec<isize>,
    dtype: DType,
    writable: bool,
    buffer: Option<StreamBuffer>,
}

impl Stream {
    #[inline]
    fn ptr_at(&self, coord: &[usize]) -> *mut u8 {
        let off: isize = coord
            .iter()
            .zip(self.strides.iter())
            .map(|(&c, &s)| c as isize * s)
            .sum();
        self.base.wrapping_offset(off)
    }

    /// Element type seen by the caller.
    #[inline]
    fn visible_dtype(&self) -> &DType {
        self.buffer.as_ref().map_or(&self.dtype, |b| &b.dtype)
    }
}

/// Broadcasting run iterator over several [`StridedArray`]s.
///
/// A read-write operand whose extent is 1 along an axis where others are
/// longer is a reduce operand: its stride there is 0 and the same element is
/// visited repeatedly.
pub struct NdIter {
    // Keeps the storage behind the raw stream pointers alive.
    _operands: Vec<StridedArray>,
    nop: usize,
    dims: Vec<usize>,
    streams: Vec<Stream>,
    mask_streams: Vec<Option<usize>>,
    coord: Vec<usize>,
    run_len: usize,
    run_cap: usize,
    size: usize,
    ptrs: Vec<*mut u8>,
    inner_strides: Vec<isize>,
    loaded: bool,
    finished: bool,
}

fn broadcast_dims(arrays: &[&StridedArray]) -> Result<Vec<usize>> {
    let rank = arrays[0].ndim();
    let mut dims = vec![1usize; rank];
    for arr in arrays {
        if arr.ndim() != rank {
            return Err(StridedError::RankMismatch(rank, arr.ndim()));
        }
        for (d, &e) in dims.iter_mut().zip(arr.dims()) {
            if e != 1 {
                if *d != 1 && *d != e {
                    return Err(StridedError::ShapeMismatch(
                        arrays[0].dims().to_vec(),
                        arr.dims().to_vec(),
                    ));
                }
                *d = e;
            }
        }
    }
    Ok(dims)
}

impl NdIter {
    /// Build the iterator and position it on the first run.
    pub fn new(operands: Vec<IterOperand>, config: IterConfig) -> Result<Self> {
        if operands.is_empty() {
            return Err(StridedError::RankMismatch(1, 0));
        }
        let nop = operands.len();
        let arrays: Vec<&StridedArray> = operands.iter().map(|op| &op.array).collect();
        let dims = broadcast_dims(&arrays)?;
        let size = total_len(&dims);

        let mut views = Vec::with_capacity(nop);
        let mut requested = Vec::with_capacity(nop);
        let mut needs_buffer = Vec::with_capacity(nop);
        for (i, op) in operands.iter().enumerate() {
            let view = op.array.broadcast_to(&dims)?;
            let have = view.dtype().clone();
            let want = op.dtype.clone().unwrap_or_else(|| have.clone());
            if want != have {
                let readable = can_cast(&have, &want, config.casting);
                let writable = op.access == Access::ReadOnly || can_cast(&want, &have, config.casting);
                if !readable || !writable {
                    let (from, to) = if readable { (want, have) } else { (have, want) };
                    return Err(StridedError::CastNotAllowed {
                        from,
                        to,
                        casting: config.casting,
                    });
                }
            }
            if op.mask == MaskUse::Use && !view.has_mask() {
                return Err(StridedError::MissingMask);
            }
            let buffer = op.dtype.as_ref().is_some_and(|w| *w != *view.dtype())
                || (config.aligned && !view.is_aligned());
            if buffer && !config.buffered {
                return Err(StridedError::BufferingRequired(i));
            }
            needs_buffer.push(buffer);
            requested.push(op.dtype.clone().unwrap_or_else(|| view.dtype().clone()));
            views.push(view);
        }

        // Plan over data strides followed by mask strides; the first operand is weighted 2x.
        let mut stride_sets: Vec<&[isize]> = views.iter().map(|v| v.strides()).collect();
        let mut mask_streams = vec![None; nop];
        for (i, (view, op)) in views.iter().zip(&operands).enumerate() {
            if op.mask == MaskUse::Use {
                if let Some(ms) = view.mask_strides() {
                    mask_streams[i] = Some(stride_sets.len());
                    stride_sets.push(ms);
                }
            }
        }
        let plan = build_plan(&dims, &stride_sets, Some(0));
        log::trace!(
            "iterator plan: dims={:?} -> {:?}, streams={}",
            dims,
            plan.dims,
            stride_sets.len()
        );

        let any_buffered = needs_buffer.iter().any(|&b| b);
        let run_cap = if any_buffered {
            config.buffer_size.max(1)
        } else {
            usize::MAX
        };
        let inner_extent = plan.dims[0];

        let mut streams = Vec::with_capacity(stride_sets.len());
        for (i, view) in views.iter().enumerate() {
            let strides = plan.strides[i].clone();
            let buffer = if needs_buffer[i] {
                let single = strides[0] == 0;
                let count = if single { 1 } else { run_cap.min(inner_extent) };
                Some(StreamBuffer {
                    buf: Buffer::zeroed(count * requested[i].itemsize())?,
                    dtype: requested[i].clone(),
                    single,
                })
            } else {
                None
            };
            streams.push(Stream {
                base: view.ptr(),
                strides,
                dtype: view.dtype().clone(),
                writable: operands[i].access == Access::ReadWrite,
                buffer,
            });
        }
        for (i, view) in views.iter().enumerate() {
            if let (Some(stream), Some(mask_ptr)) = (mask_streams[i], view.mask_ptr()) {
                streams.push(Stream {
                    base: mask_ptr,
                    strides: plan.strides[stream].clone(),
                    dtype: DType::U8,
                    writable: operands[i].access == Access::ReadWrite,
                    buffer: None,
                });
            }
        }

        let nstreams = streams.len();
        let mut iter = Self {
            _operands: views,
            nop,
            coord: vec![0; plan.dims.len()],
            dims: plan.dims,
            streams,
            mask_streams,
            run_len: 0,
            run_cap,
            size,
            ptrs: vec![std::ptr::null_mut(); nstreams],
            inner_strides: vec![0; nstreams],
            loaded: false,
            finished: size == 0,
        };
        if !iter.finished {
            iter.start_run()?;
        }
        Ok(iter)
    }

    /// Total number of elements in the broadcast iteration space.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of array operands.
    #[inline]
    pub fn nop(&self) -> usize {
        self.nop
    }

    /// Number of pointer streams (data plus masks).
    #[inline]
    pub fn nstreams(&self) -> usize {
        self.streams.len()
    }

    /// Stream index of operand `op`'s mask, if it was opened with [`MaskUse::Use`].
    #[inline]
    pub fn mask_stream(&self, op: usize) -> Option<usize> {
        self.mask_streams.get(op).copied().flatten()
    }

    /// Run-start pointers, one per stream.
    #[inline]
    pub fn data_ptrs(&self) -> &[*mut u8] {
        &self.ptrs
    }

    /// Inner byte strides, one per stream.
    #[inline]
    pub fn inner_strides(&self) -> &[isize] {
        &self.inner_strides
    }

    /// Length of the current run.
    #[inline]
    pub fn inner_len(&self) -> usize {
        self.run_len
    }

    /// Element type the caller sees on `stream` (the requested one if buffered).
    #[inline]
    pub fn stream_dtype(&self, stream: usize) -> &DType {
        self.streams[stream].visible_dtype()
    }

    /// Whether the current run starts at coordinate 0 along every axis where
    /// operand `op` has a zero stride, i.e. whether it touches `op`'s
    /// elements for the first time.
    pub fn is_first_visit(&self, op: usize) -> bool {
        self.streams[op]
            .strides
            .iter()
            .zip(&self.coord)
            .all(|(&s, &c)| s != 0 || c == 0)
    }

    /// Pointer to element `i` of the current run on `stream`.
    #[inline]
    pub fn element_ptr(&self, stream: usize, i: usize) -> *mut u8 {
        assert!(i < self.run_len, "element {i} outside run of {}", self.run_len);
        self.ptrs[stream].wrapping_offset(i as isize * self.inner_strides[stream])
    }

    /// Read element `i` of the current run.
    ///
    /// # Panics
    /// Panics if `T` is not the stream's visible dtype or `i` is outside the run.
    #[inline]
    pub fn read<T: Element>(&self, stream: usize, i: usize) -> T {
        assert_eq!(self.stream_dtype(stream), &T::dtype(), "stream dtype mismatch");
        unsafe { (self.element_ptr(stream, i) as *const T).read_unaligned() }
    }

    /// Write element `i` of the current run.
    ///
    /// # Panics
    /// Panics if the stream belongs to a read-only operand, if `T` is not the
    /// stream's visible dtype or if `i` is outside the run.
    #[inline]
    pub fn write<T: Element>(&mut self, stream: usize, i: usize, value: T) {
        self.assert_writable(stream);
        assert_eq!(self.stream_dtype(stream), &T::dtype(), "stream dtype mismatch");
        unsafe { (self.element_ptr(stream, i) as *mut T).write_unaligned(value) }
    }

    /// Exposure of element `i` on a mask stream.
    #[inline]
    pub fn exposed(&self, mask_stream: usize, i: usize) -> bool {
        is_exposed(unsafe { *self.element_ptr(mask_stream, i) })
    }

    /// Expose or hide element `i` on a mask stream.
    ///
    /// # Panics
    /// Panics if the mask belongs to a read-only operand or `i` is outside the run.
    #[inline]
    pub fn set_exposed(&mut self, mask_stream: usize, i: usize, exposed: bool) {
        self.assert_writable(mask_stream);
        let v = if exposed { MASK_EXPOSED } else { MASK_HIDDEN };
        unsafe { *self.element_ptr(mask_stream, i) = v };
    }

    #[inline]
    fn assert_writable(&self, stream: usize) {
        assert!(self.streams[stream].writable, "stream {stream} is read-only");
    }

    fn start_run(&mut self) -> Result<()> {
        self.run_len = (self.dims[0] - self.coord[0]).min(self.run_cap);
        for (s, stream) in self.streams.iter().enumerate() {
            let ptr = stream.ptr_at(&self.coord);
            match &stream.buffer {
                Some(b) => {
                    let bstride = if b.single { 0 } else { b.dtype.itemsize() as isize };
                    let count = if b.single { 1 } else { self.run_len };
                    unsafe {
                        cast_strided(
                            b.buf.as_ptr(),
                            bstride,
                            &b.dtype,
                            ptr,
                            stream.strides[0],
                            &stream.dtype,
                            count,
                        )?;
                    }
                    self.ptrs[s] = b.buf.as_ptr();
                    self.inner_strides[s] = bstride;
                }
                None => {
                    self.ptrs[s] = ptr;
                    self.inner_strides[s] = stream.strides[0];
                }
            }
        }
        self.loaded = true;
        Ok(())
    }

    /// Write buffered read-write operands back to their arrays.
    fn flush(&mut self) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        self.loaded = false;
        for stream in &self.streams {
            if let (Some(b), true) = (&stream.buffer, stream.writable) {
                let count = if b.single { 1 } else { self.run_len };
                let bstride = if b.single { 0 } else { b.dtype.itemsize() as isize };
                unsafe {
                    cast_strided(
                        stream.ptr_at(&self.coord),
                        stream.strides[0],
                        &stream.dtype,
                        b.buf.as_ptr(),
                        bstride,
                        &b.dtype,
                        count,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Move to the next run. Returns `false` once the iteration is exhausted.
    pub fn advance(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        self.flush()?;

        self.coord[0] += self.run_len;
        if self.coord[0] >= self.dims[0] {
            self.coord[0] = 0;
            let mut level = 1usize;
            loop {
                if level == self.dims.len() {
                    self.finished = true;
                    return Ok(false);
                }
                self.coord[level] += 1;
                if self.coord[level] < self.dims[level] {
                    break;
                }
                self.coord[level] = 0;
                level += 1;
            }
        }
        self.start_run()?;
        Ok(true)
    }

    /// Write back pending buffers and release the iterator.
    ///
    /// Dropping the iterator does the same but can only log a failure.
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for NdIter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("failed to write back iterator buffers: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_into_f64(iter: &mut NdIter) {
        loop {
            for i in 0..iter.inner_len() {
                let acc: f64 = iter.read(0, i);
                let x: f64 = iter.read(1, i);
                iter.write(0, i, acc + x);
            }
            if !iter.advance().unwrap() {
                break;
            }
        }
    }

    #[test]
    fn test_reduce_operand_broadcast() {
        let out = StridedArray::zeros(DType::F64, &[2, 1]).unwrap();
        let inp = StridedArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut iter = NdIter::new(
            vec![IterOperand::read_write(out.clone()), IterOperand::read_only(inp)],
            IterConfig::default(),
        )
        .unwrap();
        assert_eq!(iter.size(), 6);
        assert_eq!(iter.inner_strides()[0], 0);
        sum_into_f64(&mut iter);
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_buffered_cast_small_buffer() {
        let out = StridedArray::zeros(DType::F32, &[1, 3]).unwrap();
        let inp = StridedArray::from_vec(&[4, 3], (1..=12).collect::<Vec<i32>>()).unwrap();
        let config = IterConfig {
            buffered: true,
            buffer_size: 2,
            ..IterConfig::default()
        };
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(out.clone()).with_dtype(DType::F64),
                IterOperand::read_only(inp).with_dtype(DType::F64),
            ],
            config,
        )
        .unwrap();
        assert!(iter.inner_len() <= 2);
        sum_into_f64(&mut iter);
        drop(iter);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![22.0, 26.0, 30.0]);
    }

    #[test]
    fn test_buffering_required() {
        let inp = StridedArray::from_vec(&[2], vec![1i32, 2]).unwrap();
        let err = NdIter::new(
            vec![IterOperand::read_only(inp).with_dtype(DType::F64)],
            IterConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StridedError::BufferingRequired(0)));
    }

    #[test]
    fn test_casting_violation() {
        let out = StridedArray::zeros(DType::I32, &[1]).unwrap();
        let config = IterConfig {
            buffered: true,
            ..IterConfig::default()
        };
        let err = NdIter::new(
            vec![IterOperand::read_write(out).with_dtype(DType::F64)],
            config,
        )
        .err()
        .unwrap();
        assert!(matches!(err, StridedError::CastNotAllowed { .. }));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = StridedArray::zeros(DType::U8, &[2, 3]).unwrap();
        let b = StridedArray::zeros(DType::U8, &[3, 3]).unwrap();
        let err = NdIter::new(
            vec![IterOperand::read_write(a), IterOperand::read_only(b)],
            IterConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StridedError::ShapeMismatch(_, _)));
    }

    #[test]
    fn test_mask_stream_and_first_visit() {
        let out = StridedArray::zeros(DType::I64, &[2, 1]).unwrap();
        let inp = StridedArray::from_vec(&[2, 2], vec![1i64, 2, 3, 4])
            .unwrap()
            .with_mask_values(&[true, false, true, true])
            .unwrap();
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(out),
                IterOperand::read_only(inp).mask_use(MaskUse::Use),
            ],
            IterConfig::default(),
        )
        .unwrap();
        assert_eq!(iter.nstreams(), 3);
        assert_eq!(iter.mask_stream(0), None);
        let m = iter.mask_stream(1).unwrap();
        let mut exposed = Vec::new();
        let mut first = Vec::new();
        loop {
            first.push(iter.is_first_visit(0));
            for i in 0..iter.inner_len() {
                exposed.push(iter.exposed(m, i));
            }
            if !iter.advance().unwrap() {
                break;
            }
        }
        assert_eq!(exposed, vec![true, false, true, true]);
        // each run covers a whole reduced row, starting at coordinate 0
        assert_eq!(first, vec![true, true]);
    }

    #[test]
    fn test_first_visit_outer_reduce_axis() {
        // reduce over axis 0 of a (3, 2) array: runs walk the kept axis
        let out = StridedArray::zeros(DType::I64, &[1, 2]).unwrap();
        let inp = StridedArray::zeros(DType::I64, &[3, 2]).unwrap();
        let mut iter = NdIter::new(
            vec![IterOperand::read_write(out), IterOperand::read_only(inp)],
            IterConfig::default(),
        )
        .unwrap();
        let mut first = Vec::new();
        loop {
            first.push(iter.is_first_visit(0));
            if !iter.advance().unwrap() {
                break;
            }
        }
        assert_eq!(first, vec![true, false, false]);
    }

    #[test]
    fn test_empty_iteration() {
        let out = StridedArray::zeros(DType::F64, &[1]).unwrap();
        let inp = StridedArray::zeros(DType::F64, &[0]).unwrap();
        let mut iter = NdIter::new(
            vec![IterOperand::read_write(out), IterOperand::read_only(inp)],
            IterConfig::default(),
        )
        .unwrap();
        assert_eq!(iter.size(), 0);
        assert!(!iter.advance().unwrap());
    }

    #[test]
    fn test_rank_zero_single_run() {
        let a = StridedArray::from_vec(&[], vec![3u32]).unwrap();
        let iter = NdIter::new(vec![IterOperand::read_only(a)], IterConfig::default()).unwrap();
        assert_eq!(iter.size(), 1);
        assert_eq!(iter.inner_len(), 1);
        assert_eq!(iter.read::<u32>(0, 0), 3);
    }

    fn masked_pair() -> (StridedArray, StridedArray) {
        let out = StridedArray::zeros(DType::F64, &[1]).unwrap();
        let inp = StridedArray::from_vec(&[4], vec![1.0f64; 4])
            .unwrap()
            .with_mask_values(&[true; 4])
            .unwrap();
        (out, inp)
    }

    #[test]
    #[should_panic(expected = "stream 1 is read-only")]
    fn test_write_to_read_only_operand_panics() {
        let (out, inp) = masked_pair();
        let mut iter = NdIter::new(
            vec![IterOperand::read_write(out), IterOperand::read_only(inp)],
            IterConfig::default(),
        )
        .unwrap();
        iter.write(1, 0, -99.0f64);
    }

    #[test]
    fn test_read_only_mask_cannot_be_hidden() {
        let (out, inp) = masked_pair();
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(out),
                IterOperand::read_only(inp.clone()).mask_use(MaskUse::Use),
            ],
            IterConfig::default(),
        )
        .unwrap();
        let m = iter.mask_stream(1).unwrap();
        let hidden = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            iter.set_exposed(m, 0, false)
        }));
        assert!(hidden.is_err());
        drop(iter);
        assert_eq!(inp.mask_values().unwrap(), vec![true; 4]);
        assert_eq!(inp.to_vec::<f64>().unwrap(), vec![1.0; 4]);
    }
}
