//! Deterministic metadata reconciliation across import sources.
//!
//! `reconcile` is a pure function: given two metadata sets and a field
//! policy table it produces one merged set, and does so identically
//! regardless of arrival order for the commutative policies. Every output
//! field carries the source that contributed it, so merge decisions stay
//! reproducible after the fact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ArchiveError, Result};

/// One metadata value with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub source: String,
}

impl FieldValue {
    pub fn new(value: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: source.into(),
        }
    }
}

/// Keyed metadata map. BTreeMap keeps iteration order stable so renders and
/// merges are deterministic.
pub type MetadataSet = BTreeMap<String, FieldValue>;

/// Per-field merge policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "source", rename_all = "snake_case")]
pub enum FieldPolicy {
    /// Always take the value contributed by the named source when present.
    PreferSource(String),
    /// Take whichever side has a value; when both do, the side whose source
    /// ranks higher in the configured fidelity order wins.
    PreferNonNull,
    /// Values are JSON string lists; merge as a sorted, deduplicated union.
    UnionSet,
    /// Values are expected to differ meaningfully per source; keep both
    /// under explicit per-source keys (`key[source]`).
    KeepBothTagged,
}

/// Field policy table plus the source fidelity ranking.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    fields: BTreeMap<String, FieldPolicy>,
    /// Earlier entries have higher declared fidelity.
    source_fidelity: Vec<String>,
}

impl ReconcilePolicy {
    pub fn new(fields: BTreeMap<String, FieldPolicy>, source_fidelity: Vec<String>) -> Self {
        Self {
            fields,
            source_fidelity,
        }
    }

    /// Look up the policy for a key: exact match first, then successively
    /// shorter dotted prefixes (`processing.hdr_gain` falls back to
    /// `processing`), then the default.
    pub fn policy_for(&self, key: &str) -> &FieldPolicy {
        if let Some(p) = self.fields.get(key) {
            return p;
        }
        let mut prefix = key;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if let Some(p) = self.fields.get(prefix) {
                return p;
            }
        }
        &FieldPolicy::PreferNonNull
    }

    fn fidelity_rank(&self, source: &str) -> usize {
        self.source_fidelity
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_fidelity.len())
    }

    /// Startup validation: a `PreferSource` policy naming a source that no
    /// configured import source matches is a configuration error and must
    /// fail loudly here, not silently pick a default per file at runtime.
    pub fn validate(&self, known_sources: &[String]) -> Result<()> {
        for (key, policy) in &self.fields {
            if let FieldPolicy::PreferSource(source) = policy {
                if !known_sources.iter().any(|s| s == source) {
                    return Err(ArchiveError::ReconcileConflict(format!(
                        "field '{key}' prefers source '{source}' which is not a configured source"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Merge two metadata sets under the policy table.
///
/// Commutative for `UnionSet` and `KeepBothTagged` fields; idempotent for
/// all policies: `reconcile(reconcile(a, b), b) == reconcile(a, b)`.
pub fn reconcile(existing: &MetadataSet, incoming: &MetadataSet, policy: &ReconcilePolicy) -> MetadataSet {
    let mut merged = MetadataSet::new();

    let mut keys: Vec<&String> = existing.keys().chain(incoming.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let left = existing.get(key);
        let right = incoming.get(key);
        let base_key = untagged_key(key);

        match policy.policy_for(base_key) {
            FieldPolicy::KeepBothTagged => {
                for fv in [left, right].into_iter().flatten() {
                    let tagged = if is_tagged_key(key) {
                        key.clone()
                    } else {
                        format!("{key}[{}]", fv.source)
                    };
                    insert_deterministic(&mut merged, tagged, fv.clone());
                }
            }
            FieldPolicy::UnionSet => match (left, right) {
                (Some(a), Some(b)) => {
                    merged.insert(key.clone(), union_values(a, b));
                }
                (Some(v), None) | (None, Some(v)) => {
                    merged.insert(key.clone(), normalize_set(v));
                }
                (None, None) => {}
            },
            FieldPolicy::PreferSource(preferred) => {
                let pick = match (left, right) {
                    (Some(a), Some(b)) => {
                        let a_hit = &a.source == preferred;
                        let b_hit = &b.source == preferred;
                        match (a_hit, b_hit) {
                            (true, false) => a,
                            (false, true) => b,
                            // Both (or neither) from the preferred source:
                            // fall back to the deterministic fidelity order.
                            _ => pick_by_fidelity(a, b, policy),
                        }
                    }
                    (Some(v), None) | (None, Some(v)) => v,
                    (None, None) => continue,
                };
                merged.insert(key.clone(), pick.clone());
            }
            FieldPolicy::PreferNonNull => {
                let pick = match (left, right) {
                    (Some(a), Some(b)) => pick_by_fidelity(a, b, policy),
                    (Some(v), None) | (None, Some(v)) => v,
                    (None, None) => continue,
                };
                merged.insert(key.clone(), pick.clone());
            }
        }
    }

    merged
}

fn is_tagged_key(key: &str) -> bool {
    key.ends_with(']') && key.contains('[')
}

fn untagged_key(key: &str) -> &str {
    match key.find('[') {
        Some(idx) if key.ends_with(']') => &key[..idx],
        _ => key,
    }
}

/// Resolve a same-key collision deterministically: higher-fidelity source
/// wins; ties break on (source, value) ordering so either argument order
/// yields the same pick.
fn pick_by_fidelity<'a>(a: &'a FieldValue, b: &'a FieldValue, policy: &ReconcilePolicy) -> &'a FieldValue {
    let ra = policy.fidelity_rank(&a.source);
    let rb = policy.fidelity_rank(&b.source);
    match ra.cmp(&rb) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            if (&a.source, &a.value) <= (&b.source, &b.value) {
                a
            } else {
                b
            }
        }
    }
}

/// Insert for tagged keys; on collision keep the greater value so the
/// operation stays commutative.
fn insert_deterministic(map: &mut MetadataSet, key: String, fv: FieldValue) {
    match map.get(&key) {
        Some(existing) if existing.value >= fv.value => {}
        _ => {
            map.insert(key, fv);
        }
    }
}

fn parse_set(value: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(items) => items,
        // Scalar fallback: treat the raw value as a one-element set.
        Err(_) => vec![value.to_string()],
    }
}

fn render_set(mut items: Vec<String>) -> String {
    items.sort();
    items.dedup();
    serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
}

fn normalize_set(fv: &FieldValue) -> FieldValue {
    FieldValue {
        value: render_set(parse_set(&fv.value)),
        source: fv.source.clone(),
    }
}

fn union_values(a: &FieldValue, b: &FieldValue) -> FieldValue {
    let mut items = parse_set(&a.value);
    items.extend(parse_set(&b.value));

    let mut sources: Vec<&str> = a.source.split('+').chain(b.source.split('+')).collect();
    sources.sort();
    sources.dedup();

    FieldValue {
        value: render_set(items),
        source: sources.join("+"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconcilePolicy {
        let mut fields = BTreeMap::new();
        fields.insert("keywords".to_string(), FieldPolicy::UnionSet);
        fields.insert("processing".to_string(), FieldPolicy::KeepBothTagged);
        fields.insert(
            "gps.timestamp".to_string(),
            FieldPolicy::PreferSource("icloud".to_string()),
        );
        ReconcilePolicy::new(
            fields,
            vec!["icloud".to_string(), "digikam".to_string(), "immich".to_string()],
        )
    }

    fn set(pairs: &[(&str, &str, &str)]) -> MetadataSet {
        pairs
            .iter()
            .map(|(k, v, s)| (k.to_string(), FieldValue::new(*v, *s)))
            .collect()
    }

    #[test]
    fn prefer_source_takes_named_source() {
        let a = set(&[("gps.timestamp", "2020-01-01T10:00:00Z", "icloud")]);
        let b = set(&[("gps.timestamp", "2020-01-01T09:58:12Z", "digikam")]);
        let merged = reconcile(&a, &b, &policy());
        assert_eq!(merged["gps.timestamp"].value, "2020-01-01T10:00:00Z");
        assert_eq!(merged["gps.timestamp"].source, "icloud");
    }

    #[test]
    fn prefer_non_null_takes_only_side_with_value() {
        let a = set(&[("caption", "sunset at the pier", "digikam")]);
        let b = MetadataSet::new();
        let merged = reconcile(&a, &b, &policy());
        assert_eq!(merged["caption"].value, "sunset at the pier");
    }

    #[test]
    fn prefer_non_null_resolves_by_fidelity() {
        let a = set(&[("caption", "low fidelity", "immich")]);
        let b = set(&[("caption", "high fidelity", "icloud")]);
        let merged = reconcile(&a, &b, &policy());
        assert_eq!(merged["caption"].source, "icloud");
        // Symmetric arguments give the same winner.
        assert_eq!(reconcile(&b, &a, &policy()), merged);
    }

    #[test]
    fn union_set_is_commutative_and_deduplicated() {
        let a = set(&[("keywords", r#"["beach","family"]"#, "icloud")]);
        let b = set(&[("keywords", r#"["family","sunset"]"#, "digikam")]);
        let p = policy();
        let ab = reconcile(&a, &b, &p);
        let ba = reconcile(&b, &a, &p);
        assert_eq!(ab, ba);
        assert_eq!(ab["keywords"].value, r#"["beach","family","sunset"]"#);
        assert_eq!(ab["keywords"].source, "digikam+icloud");
    }

    #[test]
    fn keep_both_tagged_keeps_both_under_source_keys() {
        let a = set(&[("processing.hdr_gain", "1.2", "icloud")]);
        let b = set(&[("processing.hdr_gain", "0.8", "immich")]);
        let p = policy();
        let merged = reconcile(&a, &b, &p);
        assert_eq!(merged["processing.hdr_gain[icloud]"].value, "1.2");
        assert_eq!(merged["processing.hdr_gain[immich]"].value, "0.8");
        assert_eq!(reconcile(&b, &a, &p), merged);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let a = set(&[
            ("keywords", r#"["beach"]"#, "icloud"),
            ("caption", "pier", "digikam"),
            ("processing.hdr_gain", "1.2", "icloud"),
        ]);
        let b = set(&[
            ("keywords", r#"["sunset"]"#, "digikam"),
            ("caption", "the pier", "icloud"),
            ("processing.hdr_gain", "0.8", "immich"),
        ]);
        let p = policy();
        let once = reconcile(&a, &b, &p);
        let twice = reconcile(&once, &b, &p);
        assert_eq!(once, twice);
    }

    #[test]
    fn prefix_policy_lookup() {
        let p = policy();
        assert_eq!(
            p.policy_for("processing.hdr_gain"),
            &FieldPolicy::KeepBothTagged
        );
        assert_eq!(p.policy_for("unknown.field"), &FieldPolicy::PreferNonNull);
    }

    #[test]
    fn validation_rejects_unknown_preferred_source() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "gps.timestamp".to_string(),
            FieldPolicy::PreferSource("nonexistent".to_string()),
        );
        let p = ReconcilePolicy::new(fields, vec![]);
        let err = p
            .validate(&["icloud".to_string(), "digikam".to_string()])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ReconcileConflict(_)));
    }
}
