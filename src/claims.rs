//! Claim assembly pipeline
//!
//! Merges extra claims from the peer's capability rules into a base OIDC
//! claims map. Claims reserved by OIDC or tailnet semantics are protected
//! and can never be shadowed by a capability rule.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::identity::CapRule;

/// Claims that capability rules may never overwrite. The first group are
/// standard JWT/OIDC claims; the second are the tailnet identity claims
/// carried in every ID token.
pub const PROTECTED_CLAIMS: [&str; 17] = [
    "sub", "aud", "exp", "iat", "iss", "jti", "nbf", "username", "email", "key", "addresses",
    "nid", "node", "tailnet", "tags", "user", "uid",
];

/// A capability rule tried to overwrite a protected claim.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("extra claim {claim:?} overwriting protected claim")]
pub struct ProtectedClaimError {
    /// Name of the protected claim that collided
    pub claim: String,
}

/// Merge flattened extra claims from `rules` into `base`.
///
/// # Errors
///
/// Returns [`ProtectedClaimError`] if any flattened claim is in the
/// protected set; `base` is returned unmodified in spirit (callers drop it).
pub fn with_extra_claims(
    mut base: Map<String, Value>,
    rules: &[CapRule],
) -> Result<Map<String, Value>, ProtectedClaimError> {
    let extra = flatten_extra_claims(rules);
    for (claim, value) in extra {
        if PROTECTED_CLAIMS.contains(&claim.as_str()) {
            warn!(claim = %claim, "Capability rule attempted to overwrite protected claim");
            return Err(ProtectedClaimError { claim });
        }
        base.insert(claim, value);
    }
    Ok(base)
}

/// Rules whose claims belong in /userinfo responses.
#[must_use]
pub fn rules_for_user_info(rules: &[CapRule]) -> Vec<CapRule> {
    rules
        .iter()
        .filter(|r| r.include_in_user_info)
        .cloned()
        .collect()
}

/// Rules whose claims belong in ID tokens.
#[must_use]
pub fn rules_for_id_token(rules: &[CapRule]) -> Vec<CapRule> {
    rules
        .iter()
        .filter(|r| r.include_in_id_token)
        .cloned()
        .collect()
}

/// Per-claim accumulator: dedup keys plus the first-seen typed values, in
/// observation order.
#[derive(Default)]
struct ClaimValues {
    is_list: bool,
    seen: HashSet<String>,
    values: Vec<Value>,
}

/// Merge all extra claims from `rules` into one map, deduplicating values
/// per claim. A claim observed as a list anywhere stays a list; a claim only
/// ever observed as a scalar is emitted as its single original value with
/// the source type preserved (an `int` stays an `int`, `true` never becomes
/// `"true"`).
#[must_use]
pub fn flatten_extra_claims(rules: &[CapRule]) -> Map<String, Value> {
    let mut acc: HashMap<String, ClaimValues> = HashMap::new();

    for rule in rules {
        for (claim, raw) in &rule.extra_claims {
            let entry = acc.entry(claim.clone()).or_default();
            // Once a claim has been provided as a list it is emitted as a
            // list, regardless of later scalar observations.
            if raw.is_array() {
                entry.is_list = true;
            }
            add_claim_value(entry, claim, raw);
        }
    }

    let mut result = Map::new();
    for (claim, entry) in acc {
        if entry.values.is_empty() {
            continue;
        }
        if entry.is_list {
            result.insert(claim, Value::Array(entry.values));
        } else if let Some(first) = entry.values.into_iter().next() {
            result.insert(claim, first);
        }
    }
    result
}

/// Add one claim value into the dedup set, recursing through nested lists.
/// Supported scalar kinds: string, integer, float, bool. Anything else is
/// logged and skipped.
fn add_claim_value(entry: &mut ClaimValues, claim: &str, value: &Value) {
    match value {
        Value::String(s) => {
            if entry.seen.insert(s.clone()) {
                entry.values.push(value.clone());
            }
        }
        Value::Number(n) => {
            if entry.seen.insert(n.to_string()) {
                entry.values.push(value.clone());
            }
        }
        Value::Bool(b) => {
            if entry.seen.insert(b.to_string()) {
                entry.values.push(value.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                add_claim_value(entry, claim, item);
            }
        }
        _ => {
            warn!(claim = %claim, value = %value, "Unsupported extra-claim value kind, skipping");
        }
    }
}
