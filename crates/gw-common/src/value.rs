//! The structured-value tree and change masks shared by every component.
//!
//! A [`StructuredValue`] is a flat, pre-order-indexed tree: every leaf field
//! has a stable numeric offset assigned once, at schema-construction time,
//! by a pre-order walk of the [`StructureDescriptor`] that produced it. A
//! [`ChangeMask`] is simply the set of offsets touched by some operation.

use std::collections::BTreeSet;

/// A field's stable pre-order offset within its [`StructuredValue`].
pub type FieldOffset = usize;

/// Set of field offsets denoting which fields changed.
///
/// Doubles as the "overrun mask" in [`crate::queue::MonitorQueue`]: the set
/// of offsets that changed *more than once* since the last delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeMask(BTreeSet<FieldOffset>);

impl ChangeMask {
    /// Empty mask.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `offset` as changed.
    pub fn set(&mut self, offset: FieldOffset) {
        self.0.insert(offset);
    }

    /// Whether `offset` is marked.
    pub fn contains(&self, offset: FieldOffset) -> bool {
        self.0.contains(&offset)
    }

    /// Merge `other` into `self`.
    pub fn union_with(&mut self, other: &ChangeMask) {
        self.0.extend(other.0.iter().copied());
    }

    /// `self & other`: offsets present in both — used to compute the overrun
    /// mask (bits changed once already and changed again).
    pub fn intersection(&self, other: &ChangeMask) -> ChangeMask {
        ChangeMask(self.0.intersection(&other.0).copied().collect())
    }

    /// Whether no offsets are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove every offset.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Iterate the set offsets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FieldOffset> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<FieldOffset> for ChangeMask {
    fn from_iter<T: IntoIterator<Item = FieldOffset>>(iter: T) -> Self {
        ChangeMask(iter.into_iter().collect())
    }
}

/// A leaf scalar, matching the numeric/string/enum domain of §4.A.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Signed integer, widened to the smallest lossless structured width at
    /// the `TypeMapper` layer; stored here at full width.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// IEEE-754 single precision.
    Float32(f32),
    /// IEEE-754 double precision.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Boolean (used for e.g. `+atomic`-style flags surfaced as values).
    Bool(bool),
    /// Enumerated value: `{index, choices}` pair per §4.A.
    Enum {
        /// Current selected index into `choices`.
        index: i32,
        /// The current label set.
        choices: Vec<String>,
    },
}

/// A field's value: scalar, array, or nested substructure.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A scalar leaf.
    Scalar(Scalar),
    /// An array leaf — "array fields produce `scalarArray`" (§4.A).
    Array(Vec<Scalar>),
    /// An empty placeholder for a not-yet-populated optional subtree
    /// (e.g. `display`/`control`/`valueAlarm` when the native type lacks
    /// them).
    Absent,
}

/// A concrete value tree: one [`FieldValue`] per pre-order offset.
///
/// The offsets line up with the [`StructureDescriptor`](crate::type_mapper::StructureDescriptor)
/// that described the schema; `TypeMapper` implementations are the only
/// code that needs to know the mapping from native fields to offsets.
#[derive(Debug, Clone, Default)]
pub struct StructuredValue {
    fields: Vec<FieldValue>,
}

impl StructuredValue {
    /// Allocate a value tree with `len` offsets, all initially [`FieldValue::Absent`].
    pub fn with_len(len: usize) -> Self {
        Self {
            fields: vec![FieldValue::Absent; len],
        }
    }

    /// Number of offsets (pre-order leaves) in this tree.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether this tree has no offsets.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Read the field at `offset`.
    pub fn get(&self, offset: FieldOffset) -> Option<&FieldValue> {
        self.fields.get(offset)
    }

    /// Write the field at `offset`.
    pub fn set(&mut self, offset: FieldOffset, value: FieldValue) {
        if offset >= self.fields.len() {
            self.fields.resize(offset + 1, FieldValue::Absent);
        }
        self.fields[offset] = value;
    }

    /// Copy every field named in `mask` from `src` into `self`.
    pub fn copy_masked(&mut self, src: &StructuredValue, mask: &ChangeMask) {
        for offset in mask.iter() {
            if let Some(value) = src.get(offset) {
                self.set(offset, value.clone());
            }
        }
    }
}
