//! Policy ⇄ query-string codec.
//!
//! Only deltas are written: a policy at current law encodes to the empty
//! string, and `decode → validate` restores every untouched entry from the
//! schema defaults.
//!
//! ```text
//!   PolicyTree ──encode_policy──► "tax.rate.income=0.25&benefit.amount=120"
//!        ▲                                     │
//!        └──── validate_policy ◄── decode_policy
//! ```

use crate::policy::{PolicyTree, RawPolicy};
use serde_json::Value;
use url::form_urlencoded;

/// Encode the entries that differ from their defaults, in identifier order.
pub fn encode_policy(policy: &PolicyTree) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for (id, entry) in policy.deltas() {
        query.append_pair(id, &entry.value.to_string());
    }
    query.finish()
}

/// Decode a query into a raw policy.
///
/// Accepts `a=1&b=2`, `?a=1&b=2`, or a whole location such as
/// `/uk/policy?a=1#household`. Repeated keys keep their last value. Values
/// stay strings; typing them is the validator's job.
pub fn decode_policy(query: &str) -> RawPolicy {
    let without_fragment = query.split_once('#').map_or(query, |(q, _)| q);
    let query = match without_fragment.split_once('?') {
        Some((_, q)) => q,
        None if looks_like_path(without_fragment) => "",
        None => without_fragment,
    };

    let mut raw = RawPolicy::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        raw.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    raw
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('/') || s.contains("://")
}

/// `path?query` for a share link, or bare `path` when nothing is changed.
pub fn policy_url(path: &str, policy: &PolicyTree) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let query = encode_policy(policy);
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    }
}
