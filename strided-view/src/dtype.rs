//! Runtime element descriptors and casting rules.

use std::sync::Arc;

/// One named member of a [`DType::Record`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
    /// Byte offset of the field inside the record.
    pub offset: usize,
}

/// Element type descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Structured element made of packed fields.
    Record(Arc<[Field]>),
}

/// Coarse classification used by the casting rules.
///
/// The declaration order is the `same_kind` order: a cast may move right, never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DTypeKind {
    Unsigned,
    Signed,
    Float,
    Record,
}

impl DType {
    /// Build a packed record descriptor from `(name, dtype)` pairs.
    pub fn record<S: Into<String>>(fields: impl IntoIterator<Item = (S, DType)>) -> DType {
        let mut offset = 0usize;
        let fields: Vec<Field> = fields
            .into_iter()
            .map(|(name, dtype)| {
                let field = Field {
                    name: name.into(),
                    offset,
                    dtype,
                };
                offset += field.dtype.itemsize();
                field
            })
            .collect();
        DType::Record(Arc::from(fields))
    }

    /// Size of one element in bytes.
    pub fn itemsize(&self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
            DType::Record(fields) => fields
                .iter()
                .map(|f| f.offset + f.dtype.itemsize())
                .max()
                .unwrap_or(0),
        }
    }

    /// Required alignment in bytes. Packed records only need byte alignment.
    pub fn alignment(&self) -> usize {
        match self {
            DType::Record(_) => 1,
            scalar => scalar.itemsize(),
        }
    }

    pub fn kind(&self) -> DTypeKind {
        match self {
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => DTypeKind::Unsigned,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 => DTypeKind::Signed,
            DType::F32 | DType::F64 => DTypeKind::Float,
            DType::Record(_) => DTypeKind::Record,
        }
    }

    /// Whether elements carry per-field structure.
    #[inline]
    pub fn has_fields(&self) -> bool {
        matches!(self, DType::Record(_))
    }
}

/// How permissive a conversion between element types may be.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Casting {
    /// Only identical descriptors.
    No,
    /// Identical descriptors (byte order is not modelled, so same as `No`).
    Equiv,
    /// Value-preserving conversions only.
    Safe,
    /// Safe conversions plus conversions within or up the kind order.
    #[default]
    SameKind,
    /// Any scalar conversion.
    Unsafe,
}

/// Whether `from` may be converted to `to` under the `casting` policy.
pub fn can_cast(from: &DType, to: &DType, casting: Casting) -> bool {
    if from == to {
        return true;
    }
    if from.has_fields() || to.has_fields() {
        return false;
    }
    match casting {
        Casting::No | Casting::Equiv => false,
        Casting::Safe => safe_cast(from, to),
        Casting::SameKind => safe_cast(from, to) || from.kind() <= to.kind(),
        Casting::Unsafe => true,
    }
}

fn safe_cast(from: &DType, to: &DType) -> bool {
    let (fs, ts) = (from.itemsize(), to.itemsize());
    match (from.kind(), to.kind()) {
        (DTypeKind::Unsigned, DTypeKind::Unsigned)
        | (DTypeKind::Signed, DTypeKind::Signed)
        | (DTypeKind::Float, DTypeKind::Float) => ts >= fs,
        (DTypeKind::Unsigned, DTypeKind::Signed) => ts > fs,
        // Integers fit a float whose mantissa covers them; 64-bit ints to f64 are allowed.
        (DTypeKind::Unsigned | DTypeKind::Signed, DTypeKind::Float) => {
            (ts == 4 && fs <= 2) || ts == 8
        }
        _ => false,
    }
}

/// Rust primitive types that can be stored in a [`StridedArray`](crate::StridedArray).
pub trait Element: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn dtype() -> DType;
}

macro_rules! impl_element {
    ($($t:ty => $d:ident),* $(,)?) => {
        $(
            impl Element for $t {
                #[inline]
                fn dtype() -> DType {
                    DType::$d
                }
            }
        )*
    };
}

impl_element!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
);
