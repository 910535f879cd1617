//! `GroupPV`: a composite PV aggregating N member channels with atomic (or
//! per-member) locking and a resolved trigger map (§4.G).

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::config::{FieldDef, GroupDef};
use crate::error::Result;
use crate::type_mapper::{EventBits, NativeField, StructureDescriptor, TypeMapper};
use crate::value::{ChangeMask, StructuredValue};

/// Opens a group member's upstream channel and describes its native type.
/// Both are out of scope for this crate — the real implementation talks to
/// the record database or a remote PVA channel.
pub trait MemberSource: Send + Sync {
    /// Resolve `field` to a `(TypeMapper, initial native state)` pair.
    fn open(&self, field: &FieldDef) -> Result<(Arc<dyn TypeMapper>, NativeField)>;
}

struct GroupMember {
    name: String,
    base: usize,
    mapper: Arc<dyn TypeMapper>,
    desc: StructureDescriptor,
    native: Mutex<NativeField>,
    trigger_targets: BTreeSet<usize>,
}

/// A composite PV built from a group configuration: one schema assembled
/// from N member subtrees, with atomic or per-member locking.
pub struct GroupPV {
    name: String,
    atomic_read: bool,
    atomic_notify: bool,
    members: Vec<GroupMember>,
    schema_len: usize,
}

impl std::fmt::Debug for GroupPV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPV")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .field("atomic_read", &self.atomic_read)
            .field("atomic_notify", &self.atomic_notify)
            .finish()
    }
}

impl GroupPV {
    /// One-shot schema construction from a parsed [`GroupDef`]. A field that
    /// fails to open or describe is dropped with a warning rather than
    /// aborting the whole group (§7 "partial failures during group
    /// construction").
    pub fn build(name: &str, group_def: &GroupDef, source: &dyn MemberSource) -> (Arc<GroupPV>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut survivors: Vec<(String, Arc<dyn TypeMapper>, NativeField, StructureDescriptor)> = Vec::new();

        for (field_name, field_def) in &group_def.fields {
            if field_def.channel.is_none() {
                continue; // already warned during config parsing
            }
            match source.open(field_def) {
                Ok((mapper, native)) => match mapper.describe(&native) {
                    Ok(desc) => survivors.push((field_name.clone(), mapper, native, desc)),
                    Err(e) => warnings.push(format!(
                        "group \"{name}\" field \"{field_name}\": {e}"
                    )),
                },
                Err(e) => warnings.push(format!(
                    "group \"{name}\" field \"{field_name}\": {e}"
                )),
            }
        }

        let field_names: Vec<String> = survivors.iter().map(|s| s.0.clone()).collect();
        let field_defs: Vec<FieldDef> = group_def
            .fields
            .iter()
            .filter(|(n, _)| field_names.contains(n))
            .map(|(_, d)| d.clone())
            .collect();
        let (trigger_targets, atomic_notify, trigger_warnings) =
            super::config::resolve_triggers(&field_names, &field_defs);
        warnings.extend(trigger_warnings);

        let mut members = Vec::with_capacity(survivors.len());
        let mut base = 0usize;
        for (i, (field_name, mapper, native, desc)) in survivors.into_iter().enumerate() {
            let len = desc.len;
            members.push(GroupMember {
                name: field_name,
                base,
                mapper,
                desc,
                native: Mutex::new(native),
                trigger_targets: trigger_targets[i].clone(),
            });
            base += len;
        }

        let pv = Arc::new(GroupPV {
            name: name.to_string(),
            atomic_read: group_def.atomic.unwrap_or(false),
            atomic_notify,
            members,
            schema_len: base,
        });
        (pv, warnings)
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` iff reads/writes lock every member together by default.
    pub fn atomic_read(&self) -> bool {
        self.atomic_read
    }

    /// `true` iff any trigger map was declared (§3 `GroupPV.atomicNotify`).
    pub fn atomic_notify(&self) -> bool {
        self.atomic_notify
    }

    /// Total number of pre-order offsets across every surviving member.
    pub fn schema_len(&self) -> usize {
        self.schema_len
    }

    /// Member names in declaration order, for diagnostics/tests.
    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    fn put_from_native(
        &self,
        idx: usize,
        native: &NativeField,
        target: &mut StructuredValue,
        mask: &mut ChangeMask,
    ) -> Result<()> {
        let member = &self.members[idx];
        let mut local = StructuredValue::with_len(member.desc.len);
        let mut local_mask = ChangeMask::new();
        member.mapper.put(
            &member.desc,
            &mut local,
            &mut local_mask,
            native,
            EventBits::VALUE.union(EventBits::ALARM).union(EventBits::PROPERTY),
        )?;
        for offset in local_mask.iter() {
            if let Some(value) = local.get(offset) {
                target.set(member.base + offset, value.clone());
            }
            mask.set(member.base + offset);
        }
        Ok(())
    }

    /// Read every member under one combined lock set (`allLocks`).
    pub fn read_atomic(&self) -> Result<(StructuredValue, ChangeMask)> {
        let guards: Vec<_> = self.members.iter().map(|m| m.native.lock()).collect();
        let mut value = StructuredValue::with_len(self.schema_len);
        let mut mask = ChangeMask::new();
        for (i, guard) in guards.iter().enumerate() {
            self.put_from_native(i, guard, &mut value, &mut mask)?;
        }
        Ok((value, mask))
    }

    /// Read each member under its own lock, one at a time; members may be
    /// observed at different instants.
    pub fn read_non_atomic(&self) -> Result<(StructuredValue, ChangeMask)> {
        let mut value = StructuredValue::with_len(self.schema_len);
        let mut mask = ChangeMask::new();
        for i in 0..self.members.len() {
            let guard = self.members[i].native.lock();
            self.put_from_native(i, &guard, &mut value, &mut mask)?;
        }
        Ok((value, mask))
    }

    /// Translate `mask`/`source`'s composite (global) offsets down to one
    /// member's local schema before handing them to its `TypeMapper`, the
    /// mirror image of `put_from_native`'s local-then-shift.
    fn get_to_native(
        &self,
        idx: usize,
        source: &StructuredValue,
        mask: &ChangeMask,
        target: &mut NativeField,
    ) -> Result<()> {
        let member = &self.members[idx];
        let mut local_source = StructuredValue::with_len(member.desc.len);
        let mut local_mask = ChangeMask::new();
        for offset in mask.iter().filter(|&o| o >= member.base && o < member.base + member.desc.len) {
            let local_offset = offset - member.base;
            if let Some(value) = source.get(offset) {
                local_source.set(local_offset, value.clone());
            }
            local_mask.set(local_offset);
        }
        member.mapper.get(&member.desc, &local_source, &local_mask, target)
    }

    /// Write back every member whose subtree intersects `mask`.
    pub fn write(&self, source: &StructuredValue, mask: &ChangeMask, atomic: bool) -> Result<()> {
        let touched: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| mask.iter().any(|o| o >= m.base && o < m.base + m.desc.len))
            .map(|(i, _)| i)
            .collect();

        if atomic {
            let mut guards: Vec<_> = touched.iter().map(|&i| self.members[i].native.lock()).collect();
            for (slot, &idx) in guards.iter_mut().zip(&touched) {
                self.get_to_native(idx, source, mask, slot)?;
            }
        } else {
            for &idx in &touched {
                let mut guard = self.members[idx].native.lock();
                self.get_to_native(idx, source, mask, &mut guard)?;
            }
        }
        Ok(())
    }

    /// One member's upstream produced an event. Re-reads every triggered
    /// target under the source's trigger lock set and returns a single
    /// group-level update carrying the union mask.
    ///
    /// When no group trigger map was declared, every field self-triggers,
    /// which degenerates to "emit one update per member event, carrying
    /// only that member's offsets" automatically.
    pub fn notify_member_changed(&self, source_idx: usize) -> Result<(StructuredValue, ChangeMask)> {
        let mut targets: Vec<usize> = self.members[source_idx].trigger_targets.iter().copied().collect();
        targets.sort_unstable();

        let guards: Vec<(usize, _)> = targets
            .iter()
            .map(|&idx| (idx, self.members[idx].native.lock()))
            .collect();

        let mut value = StructuredValue::with_len(self.schema_len);
        let mut mask = ChangeMask::new();
        for (idx, guard) in &guards {
            self.put_from_native(*idx, guard, &mut value, &mut mask)?;
        }
        Ok((value, mask))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::type_mapper::{NativeKind, ScalarTypeMapper};
    use crate::value::Scalar;

    struct StubSource;
    impl MemberSource for StubSource {
        fn open(&self, _field: &FieldDef) -> Result<(Arc<dyn TypeMapper>, NativeField)> {
            let mapper: Arc<dyn TypeMapper> = Arc::new(ScalarTypeMapper);
            let native = NativeField {
                kind: NativeKind::Float64,
                is_array: false,
                value: Scalar::Float64(0.0),
                array_value: Vec::new(),
                severity: 0,
                status: 0,
                message: String::new(),
                seconds_past_epoch: 0,
                nanoseconds: 0,
                user_tag: 0,
                display: None,
                control: None,
                value_alarm: None,
            };
            Ok((mapper, native))
        }
    }

    fn field(channel: &str, trigger: Option<&str>) -> FieldDef {
        FieldDef {
            channel: Some(channel.to_string()),
            type_: "scalar".into(),
            id: None,
            trigger: trigger.map(str::to_string),
            putorder: None,
        }
    }

    /// Scenario 4: trigger map `{a: {a,b}, b: {b}}`.
    #[test]
    fn member_event_notifies_trigger_targets_only() {
        let group_def = GroupDef {
            id: None,
            atomic: None,
            fields: vec![
                ("a".to_string(), field("recA", Some("a,b"))),
                ("b".to_string(), field("recB", Some("b"))),
            ],
        };
        let (pv, warnings) = GroupPV::build("G", &group_def, &StubSource);
        assert!(warnings.is_empty());
        assert!(pv.atomic_notify());

        let b_idx = pv.member_names().iter().position(|n| *n == "b").unwrap();
        let (_value, mask) = pv.notify_member_changed(b_idx).unwrap();
        let b_member = &pv.members[b_idx];
        assert!(mask.iter().all(|o| o >= b_member.base && o < b_member.base + b_member.desc.len));

        let a_idx = pv.member_names().iter().position(|n| *n == "a").unwrap();
        let (_value, mask) = pv.notify_member_changed(a_idx).unwrap();
        let a_member = &pv.members[a_idx];
        assert!(mask.iter().any(|o| o >= a_member.base && o < a_member.base + a_member.desc.len));
        assert!(mask.iter().any(|o| o >= b_member.base && o < b_member.base + b_member.desc.len));
    }

    #[test]
    fn read_atomic_covers_every_member() {
        let group_def = GroupDef {
            id: None,
            atomic: Some(true),
            fields: vec![
                ("a".to_string(), field("recA", None)),
                ("b".to_string(), field("recB", None)),
            ],
        };
        let (pv, warnings) = GroupPV::build("G", &group_def, &StubSource);
        assert!(warnings.is_empty());
        assert!(pv.atomic_read());
        let (_value, mask) = pv.read_atomic().unwrap();
        assert_eq!(mask.iter().count(), pv.schema_len());
    }

    /// Writing through the second member must land on that member's own
    /// native state, not a neighbor's — the composite mask/value use global
    /// offsets, which `write` must translate back to each member's local
    /// (0-based) schema before calling its mapper.
    #[test]
    fn write_targets_the_correct_member_by_global_offset() {
        let group_def = GroupDef {
            id: None,
            atomic: None,
            fields: vec![
                ("a".to_string(), field("recA", None)),
                ("b".to_string(), field("recB", None)),
            ],
        };
        let (pv, warnings) = GroupPV::build("G", &group_def, &StubSource);
        assert!(warnings.is_empty());

        let b_idx = pv.member_names().iter().position(|n| *n == "b").unwrap();
        let b_base = pv.members[b_idx].base;
        let value_offset = b_base + pv.members[b_idx].desc.value;

        let mut source = StructuredValue::with_len(pv.schema_len());
        source.set(value_offset, crate::value::FieldValue::Scalar(Scalar::Float64(7.5)));
        let mask: ChangeMask = [value_offset].into_iter().collect();

        pv.write(&source, &mask, true).unwrap();

        assert_eq!(pv.members[b_idx].native.lock().value, Scalar::Float64(7.5));
        let a_idx = pv.member_names().iter().position(|n| *n == "a").unwrap();
        assert_eq!(pv.members[a_idx].native.lock().value, Scalar::Float64(0.0), "untouched member must be unaffected");
    }

    #[test]
    fn field_missing_channel_is_dropped_not_fatal() {
        let mut def = FieldDef {
            type_: "scalar".into(),
            ..Default::default()
        };
        def.channel = None;
        let group_def = GroupDef {
            id: None,
            atomic: None,
            fields: vec![("broken".to_string(), def)],
        };
        let (pv, _warnings) = GroupPV::build("G", &group_def, &StubSource);
        assert_eq!(pv.member_names().len(), 0);
    }
}
