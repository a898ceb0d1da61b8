//! Conflict classification and resolution rules.
//!
//! A conflict arises when the server rejects a replayed write because its copy
//! of the resource moved on while the client was offline. Classification is
//! table-driven from the server's error code plus version/timestamp evidence;
//! resolution applies one of four strategies. The merge strategy works
//! field-by-field over JSON objects with per-resource rules.
//!
//! Every resolution carries a confidence score in `[0, 1]`: 1.0 when custom
//! per-field resolvers decided every ruled field, 0.9 for server-wins, 0.7 for
//! client-wins, and 0.3-0.9 for merges depending on rule coverage and
//! timestamp skew.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What kind of divergence the server reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictClass {
    VersionMismatch,
    ConcurrentModification,
    StaleData,
    MissingDependency,
    ValidationError,
    PermissionDenied,
    ResourceLocked,
    SchemaIncompatible,
}

/// Evidence available when classifying a conflict.
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    /// Error code returned by the server, if any.
    pub error_code: Option<String>,
    pub local_version: Option<u64>,
    pub server_version: Option<u64>,
    pub local_updated_at: Option<i64>,
    pub server_updated_at: Option<i64>,
    /// The server said a referenced entity does not exist yet.
    pub missing_dependency: bool,
}

/// Classifies a conflict. Explicit server codes win over heuristics; version
/// evidence wins over timestamps.
#[must_use]
pub fn classify_conflict(report: &ConflictReport, now: i64, stale_threshold_ms: i64) -> ConflictClass {
    if let Some(code) = report.error_code.as_deref() {
        match code {
            "VALIDATION_ERROR" => return ConflictClass::ValidationError,
            "AUTHORIZATION_ERROR" | "PERMISSION_DENIED" => {
                return ConflictClass::PermissionDenied;
            }
            "RESOURCE_LOCKED" => return ConflictClass::ResourceLocked,
            "SCHEMA_INCOMPATIBLE" => return ConflictClass::SchemaIncompatible,
            _ => {}
        }
    }
    if report.missing_dependency {
        return ConflictClass::MissingDependency;
    }
    if let (Some(local), Some(server)) = (report.local_version, report.server_version) {
        if local != server {
            return ConflictClass::VersionMismatch;
        }
    }
    if let Some(local_at) = report.local_updated_at {
        if now - local_at > stale_threshold_ms {
            return ConflictClass::StaleData;
        }
    }
    ConflictClass::ConcurrentModification
}

// ---------------------------------------------------------------------------
// Strategies and rules
// ---------------------------------------------------------------------------

/// How a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The local payload replaces the server's.
    ClientWins,
    /// The server payload is accepted; local changes are discarded.
    ServerWins,
    /// Field-by-field merge driven by [`MergeRules`].
    Merge,
    /// Parked for user input; server-wins is committed as the interim default.
    Manual,
}

/// Per-field selection rule used by the merge strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "rule")]
pub enum FieldRule {
    /// Take the local value.
    Client,
    /// Take the server value.
    Server,
    /// Take the side with the newer `updated_at`.
    LatestTimestamp,
    /// Set union by deep equality, server elements first.
    ArrayMerge,
    /// Delegate to a named resolver registered at runtime.
    Custom { resolver: String },
}

/// Field rules for one resource. Fields without a rule fall back to the
/// server value (server as base).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRules {
    pub fields: BTreeMap<String, FieldRule>,
}

impl MergeRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(field.into(), rule);
        self
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Which side the resolved payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Client,
    Server,
    Merged,
}

/// Outcome of resolving a single conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub data: Value,
    pub strategy: ConflictStrategy,
    pub data_source: DataSource,
    pub confidence: f64,
    /// The manual-resolution window elapsed and the default was committed.
    pub timed_out: bool,
    /// A manual decision is still outstanding for this item.
    pub requires_user_input: bool,
}

/// Both sides of a conflict plus their timestamps.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub local: &'a Value,
    pub server: &'a Value,
    pub local_updated_at: Option<i64>,
    pub server_updated_at: Option<i64>,
}

/// Lookup for named custom field resolvers. Returning `None` falls back to
/// the server value for that field.
pub type CustomResolverFn<'a> = &'a dyn Fn(&str, &Value, &Value) -> Option<Value>;

/// Resolves a conflict under the given strategy.
///
/// `rules` and `custom` only matter for [`ConflictStrategy::Merge`]. The
/// manual strategy returns the server payload immediately, flagged
/// `requires_user_input`; the runtime layer owns the timeout.
#[must_use]
pub fn resolve(
    input: MergeInput<'_>,
    strategy: ConflictStrategy,
    rules: Option<&MergeRules>,
    custom: Option<CustomResolverFn<'_>>,
) -> Resolution {
    match strategy {
        ConflictStrategy::ClientWins => Resolution {
            data: input.local.clone(),
            strategy,
            data_source: DataSource::Client,
            confidence: 0.7,
            timed_out: false,
            requires_user_input: false,
        },
        ConflictStrategy::ServerWins => Resolution {
            data: input.server.clone(),
            strategy,
            data_source: DataSource::Server,
            confidence: 0.9,
            timed_out: false,
            requires_user_input: false,
        },
        ConflictStrategy::Manual => Resolution {
            data: input.server.clone(),
            strategy,
            data_source: DataSource::Server,
            confidence: 0.9,
            timed_out: false,
            requires_user_input: true,
        },
        ConflictStrategy::Merge => merge(input, rules, custom),
    }
}

fn merge(
    input: MergeInput<'_>,
    rules: Option<&MergeRules>,
    custom: Option<CustomResolverFn<'_>>,
) -> Resolution {
    let (Some(local_obj), Some(server_obj)) = (input.local.as_object(), input.server.as_object())
    else {
        // Scalar payloads cannot be merged field-wise. Newer timestamp wins,
        // server on a tie or when timestamps are missing.
        let local_newer = matches!(
            (input.local_updated_at, input.server_updated_at),
            (Some(l), Some(s)) if l > s
        );
        return Resolution {
            data: if local_newer { input.local.clone() } else { input.server.clone() },
            strategy: ConflictStrategy::Merge,
            data_source: if local_newer { DataSource::Client } else { DataSource::Server },
            confidence: 0.3,
            timed_out: false,
            requires_user_input: false,
        };
    };

    let empty = MergeRules::default();
    let rules = rules.unwrap_or(&empty);

    // Server as base, local-only fields carried over.
    let mut merged: Map<String, Value> = server_obj.clone();
    for (field, value) in local_obj {
        merged.entry(field.clone()).or_insert_with(|| value.clone());
    }

    let mut ruled_fields = 0usize;
    let mut custom_fields = 0usize;

    let field_names: Vec<String> = merged.keys().cloned().collect();
    for field in &field_names {
        let Some(rule) = rules.fields.get(field) else {
            continue;
        };
        ruled_fields += 1;

        let local_value = local_obj.get(field);
        let server_value = server_obj.get(field);
        let chosen = match rule {
            FieldRule::Client => local_value.or(server_value).cloned(),
            FieldRule::Server => server_value.or(local_value).cloned(),
            FieldRule::LatestTimestamp => {
                let local_newer = matches!(
                    (input.local_updated_at, input.server_updated_at),
                    (Some(l), Some(s)) if l > s
                );
                if local_newer {
                    local_value.or(server_value).cloned()
                } else {
                    server_value.or(local_value).cloned()
                }
            }
            FieldRule::ArrayMerge => merge_arrays(local_value, server_value),
            FieldRule::Custom { resolver } => {
                let resolved = custom.and_then(|lookup| {
                    lookup(
                        resolver,
                        local_value.unwrap_or(&Value::Null),
                        server_value.unwrap_or(&Value::Null),
                    )
                });
                if resolved.is_some() {
                    custom_fields += 1;
                }
                resolved.or_else(|| server_value.or(local_value).cloned())
            }
        };
        if let Some(value) = chosen {
            merged.insert(field.clone(), value);
        }
    }

    let total_fields = field_names.len().max(1);
    let confidence = if ruled_fields > 0 && custom_fields == ruled_fields {
        1.0
    } else {
        merge_confidence(
            ruled_fields,
            total_fields,
            input.local_updated_at,
            input.server_updated_at,
        )
    };

    Resolution {
        data: Value::Object(merged),
        strategy: ConflictStrategy::Merge,
        data_source: DataSource::Merged,
        confidence,
        timed_out: false,
        requires_user_input: false,
    }
}

/// Set union by deep equality: server elements first, then local elements not
/// already present.
fn merge_arrays(local: Option<&Value>, server: Option<&Value>) -> Option<Value> {
    match (local.and_then(Value::as_array), server.and_then(Value::as_array)) {
        (Some(local_arr), Some(server_arr)) => {
            let mut union = server_arr.clone();
            for item in local_arr {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            Some(Value::Array(union))
        }
        // One side is not an array: the array side wins, else server.
        (Some(local_arr), None) => Some(Value::Array(local_arr.clone())),
        _ => server.or(local).cloned(),
    }
}

/// Merge confidence: 0.3 floor, up to +0.5 from rule coverage, +0.1 when the
/// timestamps are far enough apart (>60s) that recency is unambiguous.
/// Clamped to 0.9; full confidence is reserved for custom resolvers.
#[allow(clippy::cast_precision_loss)]
fn merge_confidence(
    ruled: usize,
    total: usize,
    local_at: Option<i64>,
    server_at: Option<i64>,
) -> f64 {
    let coverage = ruled as f64 / total as f64;
    let skew_bonus = match (local_at, server_at) {
        (Some(l), Some(s)) if (l - s).abs() > 60_000 => 0.1,
        _ => 0.0,
    };
    (0.3 + 0.5 * coverage + skew_bonus).min(0.9)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn report(code: Option<&str>) -> ConflictReport {
        ConflictReport {
            error_code: code.map(str::to_string),
            ..ConflictReport::default()
        }
    }

    #[test]
    fn classify_explicit_codes() {
        let cases = [
            ("VALIDATION_ERROR", ConflictClass::ValidationError),
            ("AUTHORIZATION_ERROR", ConflictClass::PermissionDenied),
            ("PERMISSION_DENIED", ConflictClass::PermissionDenied),
            ("RESOURCE_LOCKED", ConflictClass::ResourceLocked),
            ("SCHEMA_INCOMPATIBLE", ConflictClass::SchemaIncompatible),
        ];
        for (code, expected) in cases {
            assert_eq!(classify_conflict(&report(Some(code)), 0, 60_000), expected);
        }
    }

    #[test]
    fn classify_missing_dependency() {
        let mut r = report(None);
        r.missing_dependency = true;
        assert_eq!(classify_conflict(&r, 0, 60_000), ConflictClass::MissingDependency);
    }

    #[test]
    fn classify_version_mismatch_beats_timestamps() {
        let r = ConflictReport {
            local_version: Some(3),
            server_version: Some(5),
            local_updated_at: Some(0),
            ..ConflictReport::default()
        };
        assert_eq!(
            classify_conflict(&r, 1_000_000, 60_000),
            ConflictClass::VersionMismatch
        );
    }

    #[test]
    fn classify_stale_data() {
        let r = ConflictReport {
            local_updated_at: Some(0),
            ..ConflictReport::default()
        };
        assert_eq!(classify_conflict(&r, 120_000, 60_000), ConflictClass::StaleData);
    }

    #[test]
    fn classify_defaults_to_concurrent_modification() {
        let r = ConflictReport {
            local_updated_at: Some(90_000),
            ..ConflictReport::default()
        };
        assert_eq!(
            classify_conflict(&r, 100_000, 60_000),
            ConflictClass::ConcurrentModification
        );
    }

    fn input<'a>(local: &'a Value, server: &'a Value) -> MergeInput<'a> {
        MergeInput {
            local,
            server,
            local_updated_at: Some(1_000),
            server_updated_at: Some(2_000),
        }
    }

    #[test]
    fn client_wins_takes_local_payload() {
        let local = json!({"a": 1});
        let server = json!({"a": 2});
        let res = resolve(input(&local, &server), ConflictStrategy::ClientWins, None, None);
        assert_eq!(res.data, local);
        assert_eq!(res.data_source, DataSource::Client);
        assert!((res.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn server_wins_takes_server_payload() {
        let local = json!({"a": 1});
        let server = json!({"a": 2});
        let res = resolve(input(&local, &server), ConflictStrategy::ServerWins, None, None);
        assert_eq!(res.data, server);
        assert_eq!(res.data_source, DataSource::Server);
        assert!((res.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn manual_returns_server_default_flagged() {
        let local = json!({"a": 1});
        let server = json!({"a": 2});
        let res = resolve(input(&local, &server), ConflictStrategy::Manual, None, None);
        assert_eq!(res.data, server);
        assert!(res.requires_user_input);
        assert!(!res.timed_out);
    }

    #[test]
    fn merge_receipt_items_and_notes() {
        // The canonical merge scenario: array union for items with server as
        // base, client rule for notes.
        let local = json!({"items": ["x", "y"], "notes": "draft"});
        let server = json!({"items": ["y", "z"], "notes": "final"});
        let rules = MergeRules::new()
            .with_rule("items", FieldRule::ArrayMerge)
            .with_rule("notes", FieldRule::Client);

        let res = resolve(input(&local, &server), ConflictStrategy::Merge, Some(&rules), None);
        assert_eq!(res.data["items"], json!(["y", "z", "x"]));
        assert_eq!(res.data["notes"], "draft");
        assert_eq!(res.data_source, DataSource::Merged);
        assert_eq!(res.strategy, ConflictStrategy::Merge);
        assert!(res.confidence >= 0.7, "confidence was {}", res.confidence);
    }

    #[test]
    fn merge_unruled_fields_fall_back_to_server() {
        let local = json!({"status": "open", "client_only": true});
        let server = json!({"status": "closed"});
        let res = resolve(input(&local, &server), ConflictStrategy::Merge, None, None);
        assert_eq!(res.data["status"], "closed");
        // Local-only fields survive the merge.
        assert_eq!(res.data["client_only"], true);
    }

    #[test]
    fn merge_latest_timestamp_rule() {
        let local = json!({"total": 10});
        let server = json!({"total": 20});
        let rules = MergeRules::new().with_rule("total", FieldRule::LatestTimestamp);

        let newer_local = MergeInput {
            local: &local,
            server: &server,
            local_updated_at: Some(5_000),
            server_updated_at: Some(2_000),
        };
        let res = resolve(newer_local, ConflictStrategy::Merge, Some(&rules), None);
        assert_eq!(res.data["total"], 10);

        let newer_server = MergeInput {
            local: &local,
            server: &server,
            local_updated_at: Some(1_000),
            server_updated_at: Some(2_000),
        };
        let res = resolve(newer_server, ConflictStrategy::Merge, Some(&rules), None);
        assert_eq!(res.data["total"], 20);
    }

    #[test]
    fn merge_custom_resolver_wins_and_scores_full_confidence() {
        let local = json!({"amount": 5});
        let server = json!({"amount": 7});
        let rules =
            MergeRules::new().with_rule("amount", FieldRule::Custom { resolver: "sum".into() });
        let sum = |name: &str, l: &Value, s: &Value| -> Option<Value> {
            (name == "sum").then(|| json!(l.as_i64().unwrap_or(0) + s.as_i64().unwrap_or(0)))
        };

        let res = resolve(
            input(&local, &server),
            ConflictStrategy::Merge,
            Some(&rules),
            Some(&sum),
        );
        assert_eq!(res.data["amount"], 12);
        assert!((res.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_unknown_custom_resolver_falls_back_to_server() {
        let local = json!({"amount": 5});
        let server = json!({"amount": 7});
        let rules = MergeRules::new()
            .with_rule("amount", FieldRule::Custom { resolver: "missing".into() });

        let res = resolve(input(&local, &server), ConflictStrategy::Merge, Some(&rules), None);
        assert_eq!(res.data["amount"], 7);
        assert!(res.confidence < 1.0);
    }

    #[test]
    fn merge_scalars_picks_newer_side() {
        let local = json!("local");
        let server = json!("server");
        let newer_local = MergeInput {
            local: &local,
            server: &server,
            local_updated_at: Some(10),
            server_updated_at: Some(5),
        };
        let res = resolve(newer_local, ConflictStrategy::Merge, None, None);
        assert_eq!(res.data, local);
        assert!((res.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_confidence_is_bounded() {
        for ruled in 0..=4usize {
            let c = merge_confidence(ruled, 4, Some(0), Some(1_000_000));
            assert!((0.3..=0.9).contains(&c), "confidence {c} out of range");
        }
    }

    #[test]
    fn array_union_deduplicates_deep_equal_objects() {
        let local = json!({"items": [{"sku": "a"}, {"sku": "b"}]});
        let server = json!({"items": [{"sku": "b"}, {"sku": "c"}]});
        let rules = MergeRules::new().with_rule("items", FieldRule::ArrayMerge);

        let res = resolve(input(&local, &server), ConflictStrategy::Merge, Some(&rules), None);
        assert_eq!(
            res.data["items"],
            json!([{"sku": "b"}, {"sku": "c"}, {"sku": "a"}])
        );
    }
}
