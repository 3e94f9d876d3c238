//! Holder for the independently fetched metadata fragments.

use crate::{json_kind, Entity, Parameter, SchemaError, Variable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A named metadata resource served by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resource {
    Parameters,
    Variables,
    Entities,
    EndpointRuntimes,
}

impl Resource {
    /// Every resource a client requests on startup.
    pub const ALL: [Resource; 4] = [
        Resource::Parameters,
        Resource::Variables,
        Resource::Entities,
        Resource::EndpointRuntimes,
    ];

    /// Resources that must all be present before anything is validated.
    pub const REQUIRED: [Resource; 3] =
        [Resource::Parameters, Resource::Variables, Resource::Entities];

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Parameters => "parameters",
            Resource::Variables => "variables",
            Resource::Entities => "entities",
            Resource::EndpointRuntimes => "endpoint-runtimes",
        }
    }

    pub fn is_required(&self) -> bool {
        Self::REQUIRED.contains(self)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resource {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| SchemaError::UnknownResource(s.to_string()))
    }
}

/// One parsed metadata payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaFragment {
    Parameters(BTreeMap<String, Parameter>),
    Variables(BTreeMap<String, Variable>),
    Entities(BTreeMap<String, Entity>),
    EndpointRuntimes(Value),
}

impl SchemaFragment {
    pub fn resource(&self) -> Resource {
        match self {
            SchemaFragment::Parameters(_) => Resource::Parameters,
            SchemaFragment::Variables(_) => Resource::Variables,
            SchemaFragment::Entities(_) => Resource::Entities,
            SchemaFragment::EndpointRuntimes(_) => Resource::EndpointRuntimes,
        }
    }

    /// Parse a raw payload: a flat mapping of identifiers to records.
    ///
    /// The entities endpoint may wrap its mapping as
    /// `{"entities": {...}, "hierarchy": ...}`; the wrapper is unpacked.
    pub fn parse(resource: Resource, payload: Value) -> Result<Self, SchemaError> {
        if resource == Resource::EndpointRuntimes {
            return Ok(SchemaFragment::EndpointRuntimes(payload));
        }
        let obj = match payload {
            Value::Object(obj) => obj,
            other => {
                return Err(SchemaError::NotAnObject {
                    resource,
                    found: json_kind(&other).to_string(),
                })
            }
        };

        match resource {
            Resource::Parameters => obj
                .iter()
                .map(|(id, record)| Ok((id.clone(), Parameter::from_record(id, record)?)))
                .collect::<Result<_, SchemaError>>()
                .map(SchemaFragment::Parameters),
            Resource::Variables => obj
                .iter()
                .map(|(id, record)| Ok((id.clone(), Variable::from_record(id, record)?)))
                .collect::<Result<_, SchemaError>>()
                .map(SchemaFragment::Variables),
            Resource::Entities => {
                let wrapped = obj.get("entities").map_or(false, Value::is_object)
                    && obj.keys().all(|k| k == "entities" || k == "hierarchy");
                let records = if wrapped {
                    obj.get("entities")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default()
                } else {
                    obj
                };
                records
                    .iter()
                    .map(|(id, record)| Ok((id.clone(), Entity::from_record(id, record)?)))
                    .collect::<Result<_, SchemaError>>()
                    .map(SchemaFragment::Entities)
            }
            Resource::EndpointRuntimes => Ok(SchemaFragment::EndpointRuntimes(Value::Object(obj))),
        }
    }
}

/// Fetched fragments, in whatever order they arrived.
#[derive(Debug, Clone, Default)]
pub struct SchemaStore {
    parameters: Option<BTreeMap<String, Parameter>>,
    variables: Option<BTreeMap<String, Variable>>,
    entities: Option<BTreeMap<String, Entity>>,
    endpoint_runtimes: Option<Value>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fragment and report whether the store is now complete.
    /// Recording the same resource twice replaces the earlier payload.
    pub fn record_fetch(&mut self, fragment: SchemaFragment) -> bool {
        match fragment {
            SchemaFragment::Parameters(p) => self.parameters = Some(p),
            SchemaFragment::Variables(v) => self.variables = Some(v),
            SchemaFragment::Entities(e) => self.entities = Some(e),
            SchemaFragment::EndpointRuntimes(r) => self.endpoint_runtimes = Some(r),
        }
        self.is_complete()
    }

    /// True iff parameters, variables and entities have all been recorded.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn missing(&self) -> Vec<Resource> {
        Resource::REQUIRED
            .into_iter()
            .filter(|r| !self.has(*r))
            .collect()
    }

    pub fn has(&self, resource: Resource) -> bool {
        match resource {
            Resource::Parameters => self.parameters.is_some(),
            Resource::Variables => self.variables.is_some(),
            Resource::Entities => self.entities.is_some(),
            Resource::EndpointRuntimes => self.endpoint_runtimes.is_some(),
        }
    }

    pub fn parameters(&self) -> Option<&BTreeMap<String, Parameter>> {
        self.parameters.as_ref()
    }

    pub fn variables(&self) -> Option<&BTreeMap<String, Variable>> {
        self.variables.as_ref()
    }

    pub fn entities(&self) -> Option<&BTreeMap<String, Entity>> {
        self.entities.as_ref()
    }

    pub fn endpoint_runtimes(&self) -> Option<&Value> {
        self.endpoint_runtimes.as_ref()
    }
}
