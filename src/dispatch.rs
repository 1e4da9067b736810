//! The reduction driver.
//!
//! [`reduce`] builds the result container, folds NA masks, seeds the result
//! and hands a broadcasting [`NdIter`] over `(result, operand)` to one of
//! the caller's inner loops.
//!
//! # Stream layout seen by inner loops
//!
//! | stream | contents |
//! |--------|----------|
//! | 0 | result data (reduce operand: stride 0 along reduction axes) |
//! | 1 | operand data |
//! | 2.. | masks, result's before operand's, see [`NdIter::mask_stream`] |
//!
//! [`LoopStrategy::SingleMask`] loops see one mask stream at index 2: the
//! operand's with `skipna`, the result's without. [`LoopStrategy::DualMask`]
//! loops see the result's mask at 2 and the operand's at 3.

use strided_kernel::{IterConfig, IterOperand, MaskUse, NdIter, DEFAULT_BUFFER_SIZE};
use strided_view::{Casting, DType, StridedArray};

use crate::na::{contains_na, reduce_mask_into};
use crate::result::create_reduce_result;
use crate::seed::{check_nonreorderable_axes, seed_reduce_result};
use crate::{check_axis_flags, ReduceError, Result};

/// Inner loop of a reduction.
///
/// The loop owns the iteration: it processes the current run, calls
/// [`NdIter::advance`] and repeats until that returns `false`. The loop
/// must leave the first `skip_first_count` pre-seeded elements of each
/// result slot out of the combination; [`NdIter::is_first_visit`] on
/// operand 0 tells whether the current run starts on such elements.
pub trait ReduceLoop {
    fn run(&mut self, iter: &mut NdIter, skip_first_count: usize) -> Result<()>;
}

impl<F> ReduceLoop for F
where
    F: FnMut(&mut NdIter, usize) -> Result<()>,
{
    fn run(&mut self, iter: &mut NdIter, skip_first_count: usize) -> Result<()> {
        self(iter, skip_first_count)
    }
}

/// Fills a freshly created result with the reduction's identity.
///
/// With `preserve_na` only exposed result slots are written and the result
/// mask stays as it is; otherwise every slot is written and the mask, if
/// any, becomes fully exposed. [`strided_kernel::assign_scalar`] implements
/// exactly this contract.
pub trait AssignIdentity {
    fn assign_identity(&mut self, result: &StridedArray, preserve_na: bool) -> Result<()>;
}

impl<F> AssignIdentity for F
where
    F: FnMut(&StridedArray, bool) -> Result<()>,
{
    fn assign_identity(&mut self, result: &StridedArray, preserve_na: bool) -> Result<()> {
        self(result, preserve_na)
    }
}

/// Which inner loop a reduction call dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopStrategy {
    /// No masks involved.
    Plain,
    /// One mask stream: the operand's (skipna) or the result's (NA propagation).
    SingleMask,
    /// Both masks, for loops that may expose result slots themselves.
    DualMask,
}

/// The caller's inner loops, one per [`LoopStrategy`].
#[derive(Default)]
pub struct ReduceLoops<'a> {
    plain: Option<Box<dyn ReduceLoop + 'a>>,
    masked: Option<Box<dyn ReduceLoop + 'a>>,
    advanced_masked: Option<Box<dyn ReduceLoop + 'a>>,
}

impl<'a> ReduceLoops<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loop for unmasked reductions.
    pub fn plain(mut self, l: impl ReduceLoop + 'a) -> Self {
        self.plain = Some(Box::new(l));
        self
    }

    /// Loop for reductions with one mask stream.
    pub fn masked(mut self, l: impl ReduceLoop + 'a) -> Self {
        self.masked = Some(Box::new(l));
        self
    }

    /// Loop seeing both the result's and the operand's mask.
    pub fn advanced_masked(mut self, l: impl ReduceLoop + 'a) -> Self {
        self.advanced_masked = Some(Box::new(l));
        self
    }

    #[inline]
    pub fn has_advanced_masked(&self) -> bool {
        self.advanced_masked.is_some()
    }

    fn select(&mut self, strategy: LoopStrategy) -> Option<&mut (dyn ReduceLoop + 'a)> {
        match strategy {
            LoopStrategy::Plain => self.plain.as_deref_mut(),
            LoopStrategy::SingleMask => self.masked.as_deref_mut(),
            LoopStrategy::DualMask => self.advanced_masked.as_deref_mut(),
        }
    }
}

/// Scalar parameters of a [`reduce`] call.
#[derive(Clone, Debug)]
pub struct ReduceConfig {
    /// Operation name used in error messages.
    pub name: String,
    /// Element type the inner loop sees for the operand.
    pub operand_dtype: DType,
    /// Element type of an allocated result, and what the loop sees for it.
    pub result_dtype: DType,
    pub casting: Casting,
    /// Whether the combination may visit several axes in any order.
    pub reorderable: bool,
    /// Skip hidden elements instead of propagating NA.
    pub skipna: bool,
    /// Keep reduced axes at extent 1 in an allocated result.
    pub keepdims: bool,
    /// Carry the operand's subtype tag onto an allocated result.
    pub preserve_subtype: bool,
    /// Buffered run length in elements; 0 means [`DEFAULT_BUFFER_SIZE`].
    pub buffer_size: usize,
    /// Secondary selection mask. Not supported; rejected.
    pub where_mask: Option<StridedArray>,
    /// Per-NA-kind skip flags. Not supported; rejected.
    pub skip_which_na: Option<Vec<bool>>,
}

impl ReduceConfig {
    pub fn new(name: impl Into<String>, operand_dtype: DType, result_dtype: DType) -> Self {
        Self {
            name: name.into(),
            operand_dtype,
            result_dtype,
            casting: Casting::SameKind,
            reorderable: true,
            skipna: false,
            keepdims: false,
            preserve_subtype: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            where_mask: None,
            skip_which_na: None,
        }
    }

    pub fn casting(mut self, casting: Casting) -> Self {
        self.casting = casting;
        self
    }

    pub fn reorderable(mut self, reorderable: bool) -> Self {
        self.reorderable = reorderable;
        self
    }

    pub fn skipna(mut self, skipna: bool) -> Self {
        self.skipna = skipna;
        self
    }

    pub fn keepdims(mut self, keepdims: bool) -> Self {
        self.keepdims = keepdims;
        self
    }

    pub fn preserve_subtype(mut self, preserve_subtype: bool) -> Self {
        self.preserve_subtype = preserve_subtype;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn where_mask(mut self, mask: StridedArray) -> Self {
        self.where_mask = Some(mask);
        self
    }

    pub fn skip_which_na(mut self, flags: Vec<bool>) -> Self {
        self.skip_which_na = Some(flags);
        self
    }
}

/// Reduce `operand` along the axes flagged in `axis_flags`.
///
/// Steps:
/// 1. If the operand is masked, `skipna` is off and `out` has no mask, the
///    operand must not contain NA; its mask is then ignored.
/// 2. The result comes from `out` (conformed) or is allocated, with a mask
///    when NA propagation needs one.
/// 3. With NA propagation the operand mask is reduced into the result mask
///    first; a single hidden result slot ends the call early unless an
///    advanced masked loop could expose it.
/// 4. The result is seeded through `identity`, or from the operand itself
///    when there is none.
/// 5. The selected inner loop runs over the buffered iterator.
///
/// Returns `out` itself when given, otherwise the allocated result with the
/// reduced axes removed unless `keepdims`.
pub fn reduce(
    operand: &StridedArray,
    out: Option<&StridedArray>,
    axis_flags: &[bool],
    config: ReduceConfig,
    identity: Option<&mut dyn AssignIdentity>,
    mut loops: ReduceLoops<'_>,
) -> Result<StridedArray> {
    let ReduceConfig {
        name,
        operand_dtype,
        result_dtype,
        casting,
        reorderable,
        skipna,
        keepdims,
        preserve_subtype,
        buffer_size,
        where_mask,
        skip_which_na,
    } = config;

    if where_mask.is_some() {
        return Err(ReduceError::WhereMaskUnsupported);
    }
    if skip_which_na.is_some() {
        return Err(ReduceError::SkipWhichNaUnsupported);
    }
    check_axis_flags(operand.ndim(), axis_flags)?;

    let mut use_mask = operand.has_mask();
    if use_mask && !skipna && out.is_some_and(|o| !o.has_mask()) {
        if contains_na(operand) {
            return Err(ReduceError::NaToUnmaskedOutput);
        }
        use_mask = false;
    }
    let operand = if use_mask {
        operand.clone()
    } else {
        operand.without_mask()
    };

    let strategy = match (use_mask, skipna, loops.has_advanced_masked()) {
        (false, _, _) => LoopStrategy::Plain,
        (true, false, true) => LoopStrategy::DualMask,
        (true, _, _) => LoopStrategy::SingleMask,
    };
    log::debug!(
        "reduce {name}: operand {:?} {:?}, axes {:?}, strategy {:?}, skipna={skipna}",
        operand.dims(),
        operand.dtype(),
        axis_flags,
        strategy
    );

    let result = create_reduce_result(
        &operand,
        out,
        result_dtype.clone(),
        axis_flags,
        use_mask && !skipna,
        keepdims,
        preserve_subtype,
        &name,
    )?;

    let pass = Pass {
        name: &name,
        operand_dtype,
        result_dtype,
        casting,
        buffer_size,
        reorderable,
        skipna,
        use_mask,
        strategy,
    };
    if run_reduction(&operand, &result, axis_flags, pass, identity, &mut loops)? {
        log::trace!("reduce {name}: finished");
    }

    match out {
        Some(out) => Ok(out.clone()),
        None if keepdims => Ok(result),
        None => Ok(result.remove_axes(axis_flags)?),
    }
}

/// Settings of one reduction after option checks and strategy selection.
struct Pass<'a> {
    name: &'a str,
    operand_dtype: DType,
    result_dtype: DType,
    casting: Casting,
    buffer_size: usize,
    reorderable: bool,
    skipna: bool,
    use_mask: bool,
    strategy: LoopStrategy,
}

/// Steps 3 to 5 of [`reduce`]. Returns `false` when the computation was
/// short-circuited.
fn run_reduction(
    operand: &StridedArray,
    result: &StridedArray,
    axis_flags: &[bool],
    pass: Pass<'_>,
    identity: Option<&mut dyn AssignIdentity>,
    loops: &mut ReduceLoops<'_>,
) -> Result<bool> {
    let Pass {
        name,
        operand_dtype,
        result_dtype,
        casting,
        buffer_size,
        reorderable,
        skipna,
        use_mask,
        strategy,
    } = pass;
    if use_mask && !skipna {
        reduce_mask_into(operand, result)?;
        if strategy != LoopStrategy::DualMask
            && result.len() == 1
            && result.mask_values() == Some(vec![false])
        {
            log::trace!("reduce {name}: result is a single NA, skipping computation");
            return Ok(false);
        }
    }

    let (view, skip_first_count) = match identity {
        Some(identity) => {
            if !reorderable {
                check_nonreorderable_axes(axis_flags, name)?;
            }
            identity.assign_identity(result, !skipna)?;
            (operand.clone(), 0)
        }
        None => {
            let seeded =
                seed_reduce_result(result, operand, axis_flags, reorderable, skipna, name)?;
            if seeded.view.is_empty() {
                log::trace!("reduce {name}: nothing left to combine after seeding");
                return Ok(false);
            }
            (seeded.view, seeded.skip_first_count)
        }
    };

    let result_mask = match strategy {
        LoopStrategy::Plain => MaskUse::Ignore,
        _ if skipna => MaskUse::Ignore,
        _ => MaskUse::Use,
    };
    let operand_mask = match strategy {
        LoopStrategy::Plain => MaskUse::Ignore,
        LoopStrategy::SingleMask if !skipna => MaskUse::Ignore,
        _ => MaskUse::Use,
    };
    let config = IterConfig {
        casting,
        buffer_size: if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        },
        buffered: true,
        aligned: true,
    };
    let mut iter = NdIter::new(
        vec![
            IterOperand::read_write(result.clone())
                .with_dtype(result_dtype)
                .mask_use(result_mask),
            IterOperand::read_only(view)
                .with_dtype(operand_dtype)
                .mask_use(operand_mask),
        ],
        config,
    )?;

    if iter.size() != 0 {
        let inner = loops.select(strategy).ok_or_else(|| match strategy {
            LoopStrategy::Plain => ReduceError::MissingUnmaskedLoop { name: name.into() },
            _ => ReduceError::MissingMaskedLoop { name: name.into() },
        })?;
        inner.run(&mut iter, skip_first_count)?;
    }
    iter.finish()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strided_kernel::assign_scalar;

    fn sum_f64(iter: &mut NdIter, _skip: usize) -> Result<()> {
        loop {
            for i in 0..iter.inner_len() {
                let acc: f64 = iter.read(0, i);
                let x: f64 = iter.read(1, i);
                iter.write(0, i, acc + x);
            }
            if !iter.advance()? {
                return Ok(());
            }
        }
    }

    fn zero_identity(result: &StridedArray, preserve_na: bool) -> Result<()> {
        Ok(assign_scalar(result, 0.0f64, preserve_na)?)
    }

    fn matrix() -> StridedArray {
        StridedArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
    }

    #[test]
    fn test_sum_rows_keepdims() {
        let config = ReduceConfig::new("sum", DType::F64, DType::F64).keepdims(true);
        let mut identity = zero_identity;
        let out = reduce(
            &matrix(),
            None,
            &[false, true],
            config,
            Some(&mut identity),
            ReduceLoops::new().plain(sum_f64),
        )
        .unwrap();
        assert_eq!(out.dims(), &[2, 1]);
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_rejects_where_and_skip_which_na() {
        let config = ReduceConfig::new("sum", DType::F64, DType::F64).where_mask(matrix());
        let err = reduce(&matrix(), None, &[true, true], config, None, ReduceLoops::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "reduce operations do not yet support a where mask");

        let config = ReduceConfig::new("sum", DType::F64, DType::F64).skip_which_na(vec![true]);
        let err = reduce(&matrix(), None, &[true, true], config, None, ReduceLoops::new())
            .unwrap_err();
        assert!(matches!(err, ReduceError::SkipWhichNaUnsupported));
    }

    #[test]
    fn test_missing_plain_loop() {
        let config = ReduceConfig::new("sum", DType::F64, DType::F64);
        let mut identity = zero_identity;
        let err = reduce(
            &matrix(),
            None,
            &[false, true],
            config,
            Some(&mut identity),
            ReduceLoops::new().masked(sum_f64),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "reduction operation sum did not supply an unmasked inner loop function"
        );
    }

    #[test]
    fn test_missing_loop_ignored_for_empty_iteration() {
        let a = StridedArray::zeros(DType::F64, &[0, 3]).unwrap();
        let config = ReduceConfig::new("sum", DType::F64, DType::F64);
        let mut identity = zero_identity;
        let out = reduce(&a, None, &[true, false], config, Some(&mut identity), ReduceLoops::new())
            .unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![0.0; 3]);
    }
}
