//! Group configuration parsing and trigger-map resolution.
//!
//! Grounded in `epics-base`'s `GroupConfig::parse` and
//! `PDBProcessor::resolveTriggers` (`pdbApp/pdb.cpp`, `pdbApp/pdbgroup.h`):
//! unknown keys and dangling trigger references produce a warning and are
//! skipped rather than aborting construction; a group with no declared
//! trigger at all defaults every field to self-trigger, but once *any*
//! field in the group declares `+trigger`, only the declared mappings
//! apply — fields that never declare `+trigger` notify nobody. That is the
//! original's actual behavior, not merely "fields without a trigger
//! self-trigger" in isolation.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// One field definition inside a group object.
#[derive(Debug, Clone, Default)]
pub struct FieldDef {
    /// `+channel`: source path relative to this record.
    pub channel: Option<String>,
    /// `+type`: `TypeMapper` selector; default `"scalar"`.
    pub type_: String,
    /// `+id`: structure identifier for this field's subtree.
    pub id: Option<String>,
    /// `+trigger`: comma-separated target field names, `"*"` meaning all.
    pub trigger: Option<String>,
    /// `+putorder`: write ordering hint.
    pub putorder: Option<i32>,
}

/// One group object.
#[derive(Debug, Clone, Default)]
pub struct GroupDef {
    /// `+id`: reported as the composite type's identifier.
    pub id: Option<String>,
    /// `+atomic`: default `atomicRead`.
    pub atomic: Option<bool>,
    /// Field name → definition, in declaration order.
    pub fields: Vec<(String, FieldDef)>,
}

/// The parsed top-level group configuration.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    /// Group name → definition.
    pub groups: BTreeMap<String, GroupDef>,
}

impl GroupConfig {
    /// Parse a group configuration document, collecting unknown-key
    /// warnings instead of failing (§6).
    pub fn parse(json: &Value) -> (GroupConfig, Vec<String>) {
        let mut warnings = Vec::new();
        let mut config = GroupConfig::default();

        let Some(top) = json.as_object() else {
            warnings.push("group configuration root must be a JSON object".into());
            return (config, warnings);
        };

        for (group_name, group_value) in top {
            let Some(group_obj) = group_value.as_object() else {
                warnings.push(format!("group \"{group_name}\" must be a JSON object"));
                continue;
            };

            let mut def = GroupDef::default();
            for (key, value) in group_obj {
                match key.as_str() {
                    "+id" => def.id = value.as_str().map(str::to_string),
                    "+atomic" => match value.as_bool() {
                        Some(b) => def.atomic = Some(b),
                        None => warnings.push(format!(
                            "group \"{group_name}\": +atomic must be a boolean"
                        )),
                    },
                    field_name => {
                        let Some(field_obj) = value.as_object() else {
                            warnings.push(format!(
                                "group \"{group_name}\" field \"{field_name}\" must be a JSON object"
                            ));
                            continue;
                        };
                        let mut field = FieldDef {
                            type_: "scalar".to_string(),
                            ..Default::default()
                        };
                        for (fkey, fvalue) in field_obj {
                            match fkey.as_str() {
                                "+channel" => field.channel = fvalue.as_str().map(str::to_string),
                                "+type" => {
                                    if let Some(s) = fvalue.as_str() {
                                        field.type_ = s.to_string();
                                    }
                                }
                                "+id" => field.id = fvalue.as_str().map(str::to_string),
                                "+trigger" => field.trigger = fvalue.as_str().map(str::to_string),
                                "+putorder" => field.putorder = fvalue.as_i64().map(|i| i as i32),
                                other => warnings.push(format!(
                                    "group \"{group_name}\" field \"{field_name}\": unknown key \"{other}\""
                                )),
                            }
                        }
                        if field.channel.is_none() {
                            warnings.push(format!(
                                "group \"{group_name}\" field \"{field_name}\": missing +channel"
                            ));
                        }
                        def.fields.push((field_name.to_string(), field));
                    }
                }
            }
            config.groups.insert(group_name.clone(), def);
        }

        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        (config, warnings)
    }
}

/// One field's trigger targets, by index into the group's member list.
pub type TriggerMap = Vec<BTreeSet<usize>>;

/// Validate field references and resolve the trigger bitmap for one group's
/// field list, returning `(per-field targets, atomicNotify, warnings)`.
pub fn resolve_triggers(field_names: &[String], field_defs: &[FieldDef]) -> (TriggerMap, bool, Vec<String>) {
    let mut warnings = Vec::new();
    let index_of: BTreeMap<&str, usize> = field_names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let has_triggers = field_defs.iter().any(|f| f.trigger.is_some());
    let mut targets: TriggerMap = vec![BTreeSet::new(); field_names.len()];

    if !has_triggers {
        for (i, t) in targets.iter_mut().enumerate() {
            t.insert(i);
        }
        return (targets, false, warnings);
    }

    for (src_idx, field) in field_defs.iter().enumerate() {
        let Some(trigger) = &field.trigger else {
            continue;
        };
        for target in trigger.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if target == "*" {
                for i in 0..field_names.len() {
                    targets[src_idx].insert(i);
                }
                continue;
            }
            match index_of.get(target) {
                Some(&target_idx) => {
                    targets[src_idx].insert(target_idx);
                }
                None => warnings.push(format!(
                    "trigger from \"{}\" names non-existent field \"{target}\"",
                    field_names[src_idx]
                )),
            }
        }
    }

    (targets, true, warnings)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn parses_field_and_group_keys() {
        let json = serde_json::json!({
            "grp": {
                "+id": "demo:1.0",
                "+atomic": true,
                "a": {"+channel": "recA", "+trigger": "a,b"},
                "b": {"+channel": "recB"}
            }
        });
        let (config, warnings) = GroupConfig::parse(&json);
        assert!(warnings.is_empty());
        let grp = &config.groups["grp"];
        assert_eq!(grp.id.as_deref(), Some("demo:1.0"));
        assert_eq!(grp.atomic, Some(true));
        assert_eq!(grp.fields.len(), 2);
    }

    #[test]
    fn unknown_key_warns_but_does_not_abort() {
        let json = serde_json::json!({
            "grp": { "a": {"+channel": "recA", "+bogus": 1} }
        });
        let (config, warnings) = GroupConfig::parse(&json);
        assert_eq!(warnings.len(), 1);
        assert_eq!(config.groups["grp"].fields.len(), 1);
    }

    /// Scenario 4: trigger map `{a: {a,b}, b: {b}}`.
    #[test]
    fn resolves_explicit_trigger_map() {
        let names = vec!["a".to_string(), "b".to_string()];
        let defs = vec![
            FieldDef {
                trigger: Some("a,b".into()),
                ..Default::default()
            },
            FieldDef::default(),
        ];
        let (targets, atomic_notify, warnings) = resolve_triggers(&names, &defs);
        assert!(warnings.is_empty());
        assert!(atomic_notify);
        assert_eq!(targets[0], BTreeSet::from([0, 1]));
        assert!(targets[1].is_empty(), "b never declares +trigger, so it notifies nobody");
    }

    #[test]
    fn no_triggers_declared_defaults_every_field_to_self_trigger() {
        let names = vec!["a".to_string(), "b".to_string()];
        let defs = vec![FieldDef::default(), FieldDef::default()];
        let (targets, atomic_notify, _warnings) = resolve_triggers(&names, &defs);
        assert!(!atomic_notify);
        assert_eq!(targets[0], BTreeSet::from([0]));
        assert_eq!(targets[1], BTreeSet::from([1]));
    }

    #[test]
    fn trigger_naming_unknown_field_warns_and_is_skipped() {
        let names = vec!["a".to_string()];
        let defs = vec![FieldDef {
            trigger: Some("nope".into()),
            ..Default::default()
        }];
        let (targets, _atomic_notify, warnings) = resolve_triggers(&names, &defs);
        assert_eq!(warnings.len(), 1);
        assert!(targets[0].is_empty());
    }

    #[test]
    fn wildcard_trigger_expands_to_all_fields() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let defs = vec![
            FieldDef {
                trigger: Some("*".into()),
                ..Default::default()
            },
            FieldDef::default(),
            FieldDef::default(),
        ];
        let (targets, _atomic_notify, _warnings) = resolve_triggers(&names, &defs);
        assert_eq!(targets[0], BTreeSet::from([0, 1, 2]));
    }
}
