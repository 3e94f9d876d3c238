//! PolicyEngine client reconciliation
//!
//! Turns independently fetched metadata, a page location and a household
//! description into one consistent, validated state:
//!
//! ```text
//!   MetadataSource ──(JoinSet, any order)──► ReconciliationOrchestrator
//!                                                │
//!                    ┌───────────────────────────┼──────────────────────┐
//!                    ▼                           ▼                      ▼
//!            SchemaStore + merge         decode_policy(location)   default situation
//!                    │                           │                      │
//!                    └──────────► Schema ──► validate_policy    validate_situation
//!                                                │                      │
//!                                                ▼                      ▼
//!                                      ReconciliationState { policy, situation, ready }
//!                                                │
//!                                   encode_policy ──► share link
//! ```
//!
//! Validation never fails: anything that cannot be honoured is defaulted or
//! dropped and reported as a [`ValidationIssue`]. Only metadata that cannot
//! be obtained is an error ([`ReconcileError`]).

pub mod config;
pub mod fetch;
pub mod issue;
pub mod orchestrator;
pub mod policy;
pub mod situation;
pub mod url_codec;

use policyengine_schema::{Entity, Parameter, Resource, SchemaError, Variable};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub use config::{ClientConfig, ConfigError};
#[cfg(feature = "http")]
pub use fetch::HttpMetadataSource;
pub use fetch::{FetchError, MetadataSource, StaticMetadataSource};
pub use issue::{count_kind, IssueKind, ValidationIssue};
pub use orchestrator::{
    EditOutcome, Phase, ReconcileEvent, ReconcileEventHandler, ReconciliationOrchestrator,
};
pub use policy::{
    resolve_identifier, validate_policy, ParameterMetadata, PolicyEntry, PolicyTree,
    PolicyValidation, RawPolicy,
};
pub use situation::{
    validate_situation, SituationInstance, SituationTree, SituationValidation, SituationValue,
};
pub use url_codec::{decode_policy, encode_policy, policy_url};

// ============================================================================
// Published State
// ============================================================================

/// Everything a client renders. Created empty; only the orchestrator
/// mutates it. `policy` and `situation` stay `None` until `ready`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationState {
    pub parameters: Option<BTreeMap<String, Parameter>>,
    pub variables: Option<BTreeMap<String, Variable>>,
    pub entities: Option<BTreeMap<String, Entity>>,
    /// Current law: the policy with every value at its default.
    pub baseline: Option<PolicyTree>,
    pub policy: Option<PolicyTree>,
    pub situation: Option<SituationTree>,
    pub endpoint_runtimes: Option<Value>,
    pub issues: Vec<ValidationIssue>,
    pub ready: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to fetch {resource}: {source}")]
    Fetch {
        resource: Resource,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("fetch task failed: {0}")]
    Task(String),
}
