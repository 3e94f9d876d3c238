//! Reconciliation Orchestrator: drives a client from "nothing fetched" to a
//! published, validated policy and situation.
//!
//! ```text
//!  Loading ──(store complete)──► Merging ──► Validating ──► Ready
//!     │                                                       ▲
//!     └──(required fetch failed)──► Failed          edits ────┘ (validators only)
//! ```
//!
//! The orchestrator is a plain owned value. Fetches run concurrently in
//! [`load`](ReconciliationOrchestrator::load), but only the joining task
//! mutates state, so nothing here needs a lock.

use crate::config::ClientConfig;
use crate::fetch::{FetchError, MetadataSource};
use crate::issue::ValidationIssue;
use crate::policy::{resolve_identifier, validate_policy, RawPolicy};
use crate::situation::validate_situation;
use crate::url_codec::{decode_policy, encode_policy, policy_url};
use crate::{ReconcileError, ReconciliationState};
use policyengine_schema::{
    merge_schema, CountryProfile, Resource, Schema, SchemaFragment, SchemaStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

// ============================================================================
// Phases and Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Merging,
    Validating,
    Ready,
    Failed { resource: Resource, message: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Failed { .. })
    }
}

/// Events emitted while reconciling
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    FragmentRecorded { resource: Resource, complete: bool },
    PhaseChanged { from: Phase, to: Phase },
    EditQueued { position: usize },
    EditsReplayed { count: usize },
}

/// Callback for reconcile events
pub type ReconcileEventHandler = Box<dyn Fn(&ReconcileEvent) + Send + Sync>;

/// What happened to an edit.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    /// Held until the schema is ready; `position` is its place in the queue.
    Queued { position: usize },
    /// Validated and published. Issues are those of this edit alone.
    Applied { issues: Vec<ValidationIssue> },
    /// The orchestrator has failed and will never become ready.
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
enum Edit {
    Policy(RawPolicy),
    Parameter { id: String, value: Value },
    Situation(Value),
    Navigate(String),
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct ReconciliationOrchestrator {
    profile: CountryProfile,
    location: String,
    store: SchemaStore,
    schema: Option<Schema>,
    state: ReconciliationState,
    phase: Phase,
    history: Vec<Phase>,
    queue: Vec<Edit>,
    policy_issues: Vec<ValidationIssue>,
    situation_issues: Vec<ValidationIssue>,
    event_handlers: Vec<ReconcileEventHandler>,
}

impl ReconciliationOrchestrator {
    /// `location` is the page address the client was opened at; its query
    /// carries the initial policy.
    pub fn new(profile: CountryProfile, location: impl Into<String>) -> Self {
        Self {
            profile,
            location: location.into(),
            store: SchemaStore::new(),
            schema: None,
            state: ReconciliationState::default(),
            phase: Phase::Loading,
            history: vec![Phase::Loading],
            queue: Vec::new(),
            policy_issues: Vec::new(),
            situation_issues: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    /// Add an event handler
    pub fn on_event(&mut self, handler: ReconcileEventHandler) {
        self.event_handlers.push(handler);
    }

    fn emit(&self, event: ReconcileEvent) {
        for handler in &self.event_handlers {
            handler(&event);
        }
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Every phase entered so far, in order.
    pub fn phase_history(&self) -> &[Phase] {
        &self.history
    }

    pub fn profile(&self) -> &CountryProfile {
        &self.profile
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Current location, rewritten after each policy edit.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn pending_edits(&self) -> usize {
        self.queue.len()
    }

    fn transition(&mut self, to: Phase) {
        let from = std::mem::replace(&mut self.phase, to.clone());
        match &to {
            Phase::Failed { resource, message } => tracing::error!(
                country = %self.profile.name,
                resource = %resource,
                error = %message,
                "reconciliation failed"
            ),
            _ => tracing::info!(country = %self.profile.name, from = ?from, to = ?to, "phase change"),
        }
        self.history.push(to.clone());
        self.emit(ReconcileEvent::PhaseChanged { from, to });
    }

    // ========================================================================
    // Fetch Results
    // ========================================================================

    /// Record one parsed fragment. When it completes the store, merging and
    /// validation run (once) and queued edits are replayed.
    pub fn record_fetch(&mut self, fragment: SchemaFragment) -> &Phase {
        let resource = fragment.resource();
        if let SchemaFragment::EndpointRuntimes(runtimes) = &fragment {
            self.state.endpoint_runtimes = Some(runtimes.clone());
        }
        if self.phase != Phase::Loading && resource.is_required() {
            tracing::debug!(resource = %resource, phase = ?self.phase, "ignoring late fragment");
            return &self.phase;
        }

        let fragment = match fragment {
            SchemaFragment::Parameters(fetched) => {
                SchemaFragment::Parameters(self.profile.filter_parameters(fetched))
            }
            other => other,
        };
        let complete = self.store.record_fetch(fragment);
        tracing::debug!(
            resource = %resource,
            complete,
            missing = ?self.store.missing(),
            "recorded fragment"
        );
        self.emit(ReconcileEvent::FragmentRecorded { resource, complete });

        if complete && self.phase == Phase::Loading {
            self.reconcile();
        }
        &self.phase
    }

    /// Parse a raw payload and record it. A payload that does not parse
    /// fails the orchestrator when the resource is required.
    pub fn record_payload(&mut self, resource: Resource, payload: Value) -> Result<&Phase, ReconcileError> {
        match SchemaFragment::parse(resource, payload) {
            Ok(fragment) => Ok(self.record_fetch(fragment)),
            Err(err) => {
                self.record_failure(resource, &err.to_string());
                Err(err.into())
            }
        }
    }

    /// A fetch gave up. Required resources move the orchestrator to
    /// `Failed`; other resources are only logged.
    pub fn record_failure(&mut self, resource: Resource, message: &str) -> &Phase {
        if !resource.is_required() {
            tracing::warn!(resource = %resource, error = %message, "optional resource unavailable");
        } else if !self.phase.is_terminal() {
            self.transition(Phase::Failed {
                resource,
                message: message.to_string(),
            });
            let dropped = std::mem::take(&mut self.queue).len();
            if dropped > 0 {
                tracing::warn!(dropped, "discarding queued edits");
            }
        }
        &self.phase
    }

    fn reconcile(&mut self) {
        self.transition(Phase::Merging);
        let schema = match merge_schema(&self.store, &self.profile) {
            Ok(schema) => schema,
            Err(err) => {
                let resource = self
                    .store
                    .missing()
                    .first()
                    .copied()
                    .unwrap_or(Resource::Parameters);
                self.record_failure(resource, &err.to_string());
                return;
            }
        };
        self.state.parameters = Some(schema.parameters.clone());
        self.state.variables = Some(schema.variables.clone());
        self.state.entities = Some(schema.entities.clone());

        self.transition(Phase::Validating);
        let raw = decode_policy(&self.location);
        let policy = validate_policy(&raw, &schema, &self.profile.parameter_renames);
        let situation = validate_situation(&self.profile.default_situation, &schema);

        self.state.baseline = Some(policy.policy.baseline());
        self.state.policy = Some(policy.policy);
        self.state.situation = Some(situation.situation);
        self.policy_issues = policy.issues;
        self.situation_issues = situation.issues;
        self.publish_issues();
        self.schema = Some(schema);

        self.state.ready = true;
        self.transition(Phase::Ready);

        let queued = std::mem::take(&mut self.queue);
        if !queued.is_empty() {
            let count = queued.len();
            for edit in queued {
                self.apply(edit);
            }
            tracing::debug!(count, "replayed queued edits");
            self.emit(ReconcileEvent::EditsReplayed { count });
        }
    }

    fn publish_issues(&mut self) {
        self.state.issues = self
            .policy_issues
            .iter()
            .chain(&self.situation_issues)
            .cloned()
            .collect();
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Replace the whole policy with `raw`.
    pub fn edit_policy(&mut self, raw: RawPolicy) -> EditOutcome {
        self.submit(Edit::Policy(raw))
    }

    /// Change one parameter, keeping every other edit.
    pub fn set_parameter(&mut self, id: impl Into<String>, value: Value) -> EditOutcome {
        self.submit(Edit::Parameter {
            id: id.into(),
            value,
        })
    }

    /// Replace the household situation.
    pub fn edit_situation(&mut self, raw: Value) -> EditOutcome {
        self.submit(Edit::Situation(raw))
    }

    /// Follow a new location, e.g. a share link or a legacy redirect. The
    /// policy is re-read from its query.
    pub fn navigate(&mut self, location: impl Into<String>) -> EditOutcome {
        self.submit(Edit::Navigate(location.into()))
    }

    fn submit(&mut self, edit: Edit) -> EditOutcome {
        match &self.phase {
            Phase::Ready => self.apply(edit),
            Phase::Failed { resource, message } => EditOutcome::Rejected {
                reason: format!("metadata unavailable ({}): {}", resource, message),
            },
            _ => {
                if let Edit::Navigate(location) = edit {
                    // Nothing decoded yet; the new location is read on Ready.
                    self.location = location;
                    return EditOutcome::Applied { issues: Vec::new() };
                }
                self.queue.push(edit);
                let position = self.queue.len() - 1;
                tracing::debug!(position, "queued edit until ready");
                self.emit(ReconcileEvent::EditQueued { position });
                EditOutcome::Queued { position }
            }
        }
    }

    fn apply(&mut self, edit: Edit) -> EditOutcome {
        let Some(schema) = self.schema.as_ref() else {
            return EditOutcome::Rejected {
                reason: "schema not merged".to_string(),
            };
        };

        let issues = match edit {
            Edit::Situation(raw) => {
                let validated = validate_situation(&raw, schema);
                self.state.situation = Some(validated.situation);
                self.situation_issues = validated.issues.clone();
                validated.issues
            }
            Edit::Policy(raw) => self.apply_policy(&raw),
            Edit::Parameter { id, value } => {
                let mut raw = self
                    .state
                    .policy
                    .as_ref()
                    .map(|p| p.to_raw())
                    .unwrap_or_default();
                // `to_raw` is keyed by current ids, so a legacy id must land on
                // the same key rather than duplicate it.
                let id = resolve_identifier(&id, &self.profile.parameter_renames).unwrap_or(id);
                raw.insert(id, value);
                self.apply_policy(&raw)
            }
            Edit::Navigate(location) => {
                let raw = decode_policy(&location);
                self.location = location;
                self.apply_policy(&raw)
            }
        };
        self.publish_issues();
        EditOutcome::Applied { issues }
    }

    fn apply_policy(&mut self, raw: &RawPolicy) -> Vec<ValidationIssue> {
        let Some(schema) = self.schema.as_ref() else {
            return Vec::new();
        };
        let validated = validate_policy(raw, schema, &self.profile.parameter_renames);
        self.location = policy_url(&self.location, &validated.policy);
        self.state.policy = Some(validated.policy);
        self.policy_issues = validated.issues.clone();
        validated.issues
    }

    // ========================================================================
    // Sharing
    // ========================================================================

    /// Query string for the current policy; `None` until ready.
    pub fn share_query(&self) -> Option<String> {
        self.state.policy.as_ref().map(encode_policy)
    }

    /// `path?query` for the current policy; `None` until ready.
    pub fn share_url(&self, path: &str) -> Option<String> {
        self.state.policy.as_ref().map(|p| policy_url(path, p))
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Fetch every outstanding resource concurrently and record results in
    /// arrival order.
    ///
    /// Each attempt is bounded by `config.timeout_secs` (0 disables the
    /// bound) and retried up to `config.max_retries` times when the error is
    /// transient. Returns once the phase is terminal, aborting any optional
    /// fetch still in flight, or when every fetch has settled.
    pub async fn load(
        &mut self,
        source: Arc<dyn MetadataSource>,
        config: &ClientConfig,
    ) -> Result<(), ReconcileError> {
        let retry = RetrySettings::from(config);
        let mut tasks = JoinSet::new();
        for resource in Resource::ALL {
            if self.store.has(resource) {
                continue;
            }
            let source = Arc::clone(&source);
            tasks.spawn(async move {
                let result = fetch_with_retry(source.as_ref(), resource, retry).await;
                (resource, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (resource, result) = joined.map_err(|e| ReconcileError::Task(e.to_string()))?;
            match result {
                Ok(payload) => {
                    tracing::debug!(resource = %resource, "fetched");
                    if let Err(err) = self.record_payload(resource, payload) {
                        if resource.is_required() {
                            tasks.abort_all();
                            return Err(err);
                        }
                    }
                }
                Err(source) => {
                    self.record_failure(resource, &source.to_string());
                    if resource.is_required() {
                        tasks.abort_all();
                        return Err(ReconcileError::Fetch { resource, source });
                    }
                }
            }
            if self.phase.is_terminal() && !tasks.is_empty() {
                tracing::debug!(outstanding = tasks.len(), "ready, abandoning optional fetches");
                tasks.abort_all();
                break;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RetrySettings {
    timeout: Option<Duration>,
    max_retries: u32,
    backoff: Duration,
}

impl From<&ClientConfig> for RetrySettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

async fn fetch_with_retry(
    source: &dyn MetadataSource,
    resource: Resource,
    retry: RetrySettings,
) -> Result<Value, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        let result = match retry.timeout {
            Some(limit) => tokio::time::timeout(limit, source.fetch(resource))
                .await
                .unwrap_or(Err(FetchError::Timeout(limit))),
            None => source.fetch(resource).await,
        };
        match result {
            Ok(payload) => return Ok(payload),
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                tracing::warn!(
                    resource = %resource,
                    attempt,
                    max_retries = retry.max_retries,
                    error = %err,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(retry.backoff * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
