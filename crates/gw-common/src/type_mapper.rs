//! `TypeMapper`: the injected native-type ↔ structured-value conversion.
//!
//! The concrete native-type tables (the actual PVA wire types, or a record
//! database's field types) are out of scope for this crate (§1) — they are
//! supplied by whoever embeds the engine. [`ScalarTypeMapper`] is the one
//! concrete implementation shipped here: a minimal mapper over a handful of
//! scalar/array/enum native kinds, just enough to exercise and test the rest
//! of the engine without a real upstream.

use crate::error::{Error, Result};
use crate::value::{ChangeMask, FieldOffset, FieldValue, Scalar, StructuredValue};

/// Which upstream event classes caused this `put`, per §4.A's policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBits(u8);

impl EventBits {
    /// Value+alarm update, or an archive-triggered sample.
    pub const VALUE: EventBits = EventBits(0b001);
    /// Alarm-only update.
    pub const ALARM: EventBits = EventBits(0b010);
    /// Property metadata update (display/control/valueAlarm).
    pub const PROPERTY: EventBits = EventBits(0b100);
    /// `VALUE`, used interchangeably with an archiver-driven sample.
    pub const ARCHIVE: EventBits = EventBits(0b001);

    /// Combine two event classes.
    pub fn union(self, other: EventBits) -> EventBits {
        EventBits(self.0 | other.0)
    }

    /// Whether `other`'s bits are all present in `self`.
    pub fn contains(self, other: EventBits) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Native field kind, as reported by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeKind {
    /// Signed integer of the given bit width (8/16/32/64).
    Int(u8),
    /// Unsigned integer of the given bit width.
    UInt(u8),
    /// IEEE-754 single precision.
    Float32,
    /// IEEE-754 double precision.
    Float64,
    /// UTF-8 string.
    String,
    /// Enumerated value with a fixed label set.
    Enum(Vec<String>),
}

/// A native field: the value plus its ambient alarm/timestamp/property
/// metadata, exactly as the upstream source would report it.
#[derive(Debug, Clone)]
pub struct NativeField {
    /// The field's native kind.
    pub kind: NativeKind,
    /// `true` if this field is a scalar array rather than a single scalar.
    pub is_array: bool,
    /// Current value.
    pub value: Scalar,
    /// Array value, when `is_array` is set (overrides `value`'s content).
    pub array_value: Vec<Scalar>,
    /// Alarm severity (0=NONE..3=INVALID, matching PVA convention).
    pub severity: i32,
    /// Alarm status code.
    pub status: i32,
    /// Alarm message.
    pub message: String,
    /// Timestamp seconds since the PVA epoch.
    pub seconds_past_epoch: i64,
    /// Timestamp nanoseconds.
    pub nanoseconds: i32,
    /// User-defined tag.
    pub user_tag: i32,
    /// Display metadata, when the native type exposes it.
    pub display: Option<DisplayMeta>,
    /// Control metadata, when the native type exposes it.
    pub control: Option<ControlMeta>,
    /// Value-alarm metadata, when the native type exposes it.
    pub value_alarm: Option<ValueAlarmMeta>,
}

/// `display{limitLow,limitHigh,units,precision,form}`.
#[derive(Debug, Clone, Default)]
pub struct DisplayMeta {
    /// Low display limit.
    pub limit_low: f64,
    /// High display limit.
    pub limit_high: f64,
    /// Engineering units.
    pub units: String,
    /// Display precision.
    pub precision: i32,
    /// Display form (e.g. "Default", "String", "Binary", "Decimal", "Hex").
    pub form: String,
}

/// `control{limitLow,limitHigh}`.
#[derive(Debug, Clone, Default)]
pub struct ControlMeta {
    /// Low control limit.
    pub limit_low: f64,
    /// High control limit.
    pub limit_high: f64,
}

/// `valueAlarm{high/lowWarning,high/lowAlarm}`.
#[derive(Debug, Clone, Default)]
pub struct ValueAlarmMeta {
    /// High alarm threshold.
    pub high_alarm_limit: f64,
    /// High warning threshold.
    pub high_warning_limit: f64,
    /// Low warning threshold.
    pub low_warning_limit: f64,
    /// Low alarm threshold.
    pub low_alarm_limit: f64,
}

/// Pre-order offsets for the always-present `alarm` subtree.
#[derive(Debug, Clone, Copy)]
pub struct AlarmOffsets {
    /// Offset of `alarm.severity`.
    pub severity: FieldOffset,
    /// Offset of `alarm.status`.
    pub status: FieldOffset,
    /// Offset of `alarm.message`.
    pub message: FieldOffset,
}

/// Pre-order offsets for the always-present `timeStamp` subtree.
#[derive(Debug, Clone, Copy)]
pub struct TimeStampOffsets {
    /// Offset of `timeStamp.secondsPastEpoch`.
    pub seconds_past_epoch: FieldOffset,
    /// Offset of `timeStamp.nanoseconds`.
    pub nanoseconds: FieldOffset,
    /// Offset of `timeStamp.userTag`.
    pub user_tag: FieldOffset,
}

/// Pre-order offsets for an optional `display` subtree.
#[derive(Debug, Clone, Copy)]
pub struct DisplayOffsets {
    /// Offset of `display.limitLow`.
    pub limit_low: FieldOffset,
    /// Offset of `display.limitHigh`.
    pub limit_high: FieldOffset,
    /// Offset of `display.units`.
    pub units: FieldOffset,
    /// Offset of `display.precision`.
    pub precision: FieldOffset,
    /// Offset of `display.form`.
    pub form: FieldOffset,
}

/// Pre-order offsets for an optional `control` subtree.
#[derive(Debug, Clone, Copy)]
pub struct ControlOffsets {
    /// Offset of `control.limitLow`.
    pub limit_low: FieldOffset,
    /// Offset of `control.limitHigh`.
    pub limit_high: FieldOffset,
}

/// Pre-order offsets for an optional `valueAlarm` subtree.
#[derive(Debug, Clone, Copy)]
pub struct ValueAlarmOffsets {
    /// Offset of `valueAlarm.highAlarmLimit`.
    pub high_alarm_limit: FieldOffset,
    /// Offset of `valueAlarm.highWarningLimit`.
    pub high_warning_limit: FieldOffset,
    /// Offset of `valueAlarm.lowWarningLimit`.
    pub low_warning_limit: FieldOffset,
    /// Offset of `valueAlarm.lowAlarmLimit`.
    pub low_alarm_limit: FieldOffset,
}

/// Composite schema describing one native field, with stable pre-order
/// offsets assigned to every leaf.
#[derive(Debug, Clone)]
pub struct StructureDescriptor {
    /// Structure type identifier (e.g. `"epics:nt/NTScalar:1.0"`).
    pub id: String,
    /// Offset of the `value` leaf (or the array leaf, for array fields).
    pub value: FieldOffset,
    /// Offset of the `value.index` leaf, for enumerated fields.
    pub enum_choices: Option<Vec<String>>,
    /// Always-present alarm subtree offsets.
    pub alarm: AlarmOffsets,
    /// Always-present timestamp subtree offsets.
    pub time_stamp: TimeStampOffsets,
    /// Present iff the native type exposes display metadata.
    pub display: Option<DisplayOffsets>,
    /// Present iff the native type exposes control metadata.
    pub control: Option<ControlOffsets>,
    /// Present iff the native type exposes value-alarm metadata.
    pub value_alarm: Option<ValueAlarmOffsets>,
    /// Total number of pre-order offsets; use to allocate a
    /// [`StructuredValue`] of the right size.
    pub len: usize,
}

impl StructureDescriptor {
    /// The set of offsets written on every `put`, regardless of `event_bits`
    /// (the "fixed always set" of §4.A: the timestamp fields).
    pub fn always_offsets(&self) -> ChangeMask {
        [
            self.time_stamp.seconds_past_epoch,
            self.time_stamp.nanoseconds,
            self.time_stamp.user_tag,
        ]
        .into_iter()
        .collect()
    }

    /// The alarm subtree's offsets.
    pub fn alarm_offsets(&self) -> ChangeMask {
        [self.alarm.severity, self.alarm.status, self.alarm.message]
            .into_iter()
            .collect()
    }

    /// The property (display/control/valueAlarm) subtree's offsets, for
    /// whichever of those subtrees this descriptor actually has.
    pub fn property_offsets(&self) -> ChangeMask {
        let mut mask = ChangeMask::new();
        if let Some(d) = &self.display {
            for o in [d.limit_low, d.limit_high, d.units, d.precision, d.form] {
                mask.set(o);
            }
        }
        if let Some(c) = &self.control {
            mask.set(c.limit_low);
            mask.set(c.limit_high);
        }
        if let Some(v) = &self.value_alarm {
            for o in [
                v.high_alarm_limit,
                v.high_warning_limit,
                v.low_warning_limit,
                v.low_alarm_limit,
            ] {
                mask.set(o);
            }
        }
        mask
    }
}

/// Describes a native field as a structured schema, and copies values
/// between the native buffer and a [`StructuredValue`] with a change mask.
pub trait TypeMapper: Send + Sync {
    /// Describe `field`'s shape. Fails with [`Error::UnsupportedType`] if
    /// the native type cannot be represented.
    fn describe(&self, field: &NativeField) -> Result<StructureDescriptor>;

    /// Fill `target` from `src`, setting in `mask` every offset whose
    /// contents were copied, per the policy table in §4.A.
    fn put(
        &self,
        desc: &StructureDescriptor,
        target: &mut StructuredValue,
        mask: &mut ChangeMask,
        src: &NativeField,
        event_bits: EventBits,
    ) -> Result<()>;

    /// Write back into `target` every field present in `mask`; fields
    /// absent from `mask` are left untouched on the native side.
    fn get(
        &self,
        desc: &StructureDescriptor,
        source: &StructuredValue,
        mask: &ChangeMask,
        target: &mut NativeField,
    ) -> Result<()>;
}

/// The only concrete `TypeMapper` shipped by this crate: a scalar/array/enum
/// mapper covering the numeric domain rules of §4.A.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarTypeMapper;

impl TypeMapper for ScalarTypeMapper {
    fn describe(&self, field: &NativeField) -> Result<StructureDescriptor> {
        if matches!(field.kind, NativeKind::Int(w) | NativeKind::UInt(w) if ![8, 16, 32, 64].contains(&w))
        {
            return Err(Error::UnsupportedType(format!("{:?}", field.kind)));
        }

        let mut offset = 0usize;
        let mut next = || {
            let o = offset;
            offset += 1;
            o
        };

        let value = next();
        let enum_choices = match &field.kind {
            NativeKind::Enum(choices) => Some(choices.clone()),
            _ => None,
        };
        let alarm = AlarmOffsets {
            severity: next(),
            status: next(),
            message: next(),
        };
        let time_stamp = TimeStampOffsets {
            seconds_past_epoch: next(),
            nanoseconds: next(),
            user_tag: next(),
        };
        let display = field.display.as_ref().map(|_| DisplayOffsets {
            limit_low: next(),
            limit_high: next(),
            units: next(),
            precision: next(),
            form: next(),
        });
        let control = field.control.as_ref().map(|_| ControlOffsets {
            limit_low: next(),
            limit_high: next(),
        });
        let value_alarm = field.value_alarm.as_ref().map(|_| ValueAlarmOffsets {
            high_alarm_limit: next(),
            high_warning_limit: next(),
            low_warning_limit: next(),
            low_alarm_limit: next(),
        });

        let id = match (&field.kind, field.is_array) {
            (_, true) => "epics:nt/NTScalarArray:1.0".to_string(),
            (NativeKind::Enum(_), false) => "epics:nt/NTEnum:1.0".to_string(),
            (_, false) => "epics:nt/NTScalar:1.0".to_string(),
        };

        Ok(StructureDescriptor {
            id,
            value,
            enum_choices,
            alarm,
            time_stamp,
            display,
            control,
            value_alarm,
            len: offset,
        })
    }

    fn put(
        &self,
        desc: &StructureDescriptor,
        target: &mut StructuredValue,
        mask: &mut ChangeMask,
        src: &NativeField,
        event_bits: EventBits,
    ) -> Result<()> {
        if target.len() < desc.len {
            *target = StructuredValue::with_len(desc.len);
        }

        // Always: timestamp.
        target.set(
            desc.time_stamp.seconds_past_epoch,
            FieldValue::Scalar(Scalar::Int(src.seconds_past_epoch)),
        );
        target.set(
            desc.time_stamp.nanoseconds,
            FieldValue::Scalar(Scalar::Int(src.nanoseconds as i64)),
        );
        target.set(
            desc.time_stamp.user_tag,
            FieldValue::Scalar(Scalar::Int(src.user_tag as i64)),
        );
        mask.union_with(&desc.always_offsets());

        if event_bits.contains(EventBits::VALUE) {
            if src.is_array {
                target.set(desc.value, FieldValue::Array(src.array_value.clone()));
            } else if let Some(choices) = &desc.enum_choices {
                let index = match &src.value {
                    Scalar::Int(i) => *i as i32,
                    Scalar::Enum { index, .. } => *index,
                    other => {
                        return Err(Error::TypeMismatch(format!(
                            "expected enum-compatible value, got {other:?}"
                        )))
                    }
                };
                target.set(
                    desc.value,
                    FieldValue::Scalar(Scalar::Enum {
                        index,
                        choices: choices.clone(),
                    }),
                );
            } else {
                target.set(desc.value, FieldValue::Scalar(src.value.clone()));
            }
            mask.set(desc.value);
        }

        if event_bits.contains(EventBits::ALARM) {
            target.set(
                desc.alarm.severity,
                FieldValue::Scalar(Scalar::Int(src.severity as i64)),
            );
            target.set(
                desc.alarm.status,
                FieldValue::Scalar(Scalar::Int(src.status as i64)),
            );
            target.set(
                desc.alarm.message,
                FieldValue::Scalar(Scalar::String(src.message.clone())),
            );
            mask.union_with(&desc.alarm_offsets());
        }

        if event_bits.contains(EventBits::PROPERTY) {
            if let (Some(d), Some(meta)) = (&desc.display, &src.display) {
                target.set(d.limit_low, FieldValue::Scalar(Scalar::Float64(meta.limit_low)));
                target.set(d.limit_high, FieldValue::Scalar(Scalar::Float64(meta.limit_high)));
                target.set(d.units, FieldValue::Scalar(Scalar::String(meta.units.clone())));
                target.set(d.precision, FieldValue::Scalar(Scalar::Int(meta.precision as i64)));
                target.set(d.form, FieldValue::Scalar(Scalar::String(meta.form.clone())));
            }
            if let (Some(c), Some(meta)) = (&desc.control, &src.control) {
                target.set(c.limit_low, FieldValue::Scalar(Scalar::Float64(meta.limit_low)));
                target.set(c.limit_high, FieldValue::Scalar(Scalar::Float64(meta.limit_high)));
            }
            if let (Some(v), Some(meta)) = (&desc.value_alarm, &src.value_alarm) {
                target.set(v.high_alarm_limit, FieldValue::Scalar(Scalar::Float64(meta.high_alarm_limit)));
                target.set(v.high_warning_limit, FieldValue::Scalar(Scalar::Float64(meta.high_warning_limit)));
                target.set(v.low_warning_limit, FieldValue::Scalar(Scalar::Float64(meta.low_warning_limit)));
                target.set(v.low_alarm_limit, FieldValue::Scalar(Scalar::Float64(meta.low_alarm_limit)));
            }
            mask.union_with(&desc.property_offsets());
        }

        Ok(())
    }

    fn get(
        &self,
        desc: &StructureDescriptor,
        source: &StructuredValue,
        mask: &ChangeMask,
        target: &mut NativeField,
    ) -> Result<()> {
        if mask.contains(desc.value) {
            match source.get(desc.value) {
                Some(FieldValue::Scalar(s)) => target.value = s.clone(),
                Some(FieldValue::Array(a)) => target.array_value = a.clone(),
                _ => {
                    return Err(Error::TypeMismatch(
                        "value field absent or wrong shape".into(),
                    ))
                }
            }
        }
        if mask.contains(desc.alarm.severity) {
            if let Some(FieldValue::Scalar(Scalar::Int(s))) = source.get(desc.alarm.severity) {
                target.severity = *s as i32;
            }
        }
        if mask.contains(desc.alarm.status) {
            if let Some(FieldValue::Scalar(Scalar::Int(s))) = source.get(desc.alarm.status) {
                target.status = *s as i32;
            }
        }
        if mask.contains(desc.alarm.message) {
            if let Some(FieldValue::Scalar(Scalar::String(s))) = source.get(desc.alarm.message) {
                target.message = s.clone();
            }
        }
        if mask.contains(desc.time_stamp.seconds_past_epoch) {
            if let Some(FieldValue::Scalar(Scalar::Int(s))) =
                source.get(desc.time_stamp.seconds_past_epoch)
            {
                target.seconds_past_epoch = *s;
            }
        }
        if mask.contains(desc.time_stamp.nanoseconds) {
            if let Some(FieldValue::Scalar(Scalar::Int(s))) = source.get(desc.time_stamp.nanoseconds)
            {
                target.nanoseconds = *s as i32;
            }
        }
        if mask.contains(desc.time_stamp.user_tag) {
            if let Some(FieldValue::Scalar(Scalar::Int(s))) = source.get(desc.time_stamp.user_tag) {
                target.user_tag = *s as i32;
            }
        }
        Ok(())
    }
}
