//! Non-fatal problems found while normalizing user input.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Malformed identifier, or a rename chain that loops.
    UnresolvableIdentifier,
    /// Identifier resolved but absent from the schema.
    UnknownIdentifier,
    /// Same parameter supplied under its legacy and current ids.
    DuplicateIdentifier,
    /// Value not representable in the declared type; default used instead.
    TypeCoercionFailure,
    /// Value outside the parameter's bounds; clamped.
    ValueClamped,
    /// Situation group naming no known entity.
    UnknownEntity,
    /// Role member naming no person in the situation.
    UnknownMember,
    /// Variable set on an entity it does not belong to.
    EntityMismatch,
    /// Situation structure that is not the expected nesting of objects.
    MalformedInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Identifier (or situation path) the issue is about, as supplied.
    pub identifier: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} `{}`: {}", self.kind, self.identifier, self.message)
    }
}

/// Count issues of one kind; handy when asserting on validation output.
pub fn count_kind(issues: &[ValidationIssue], kind: IssueKind) -> usize {
    issues.iter().filter(|i| i.kind == kind).count()
}
