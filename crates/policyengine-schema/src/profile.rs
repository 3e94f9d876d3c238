//! Country profiles: the static, locally defined tables a client ships with.
//!
//! A profile is plain data (usually a JSON file next to the client):
//!
//! ```json
//! {
//!   "name": "uk",
//!   "apiUrl": "https://policyengine.org/uk/api",
//!   "parameterList": ["tax.income_tax", "benefit.universal_credit"],
//!   "parameterRenames": {"old.benefit.name": "new.benefit.name"},
//!   "extraParameterMetadata": {"tax.income_tax.rates.basic": {"label": "Basic rate"}},
//!   "extraVariableMetadata": {},
//!   "defaultSituation": {"people": {"you": {"age": 30}}}
//! }
//! ```

use crate::{Parameter, ParameterOverride, SchemaError, VariableOverride};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Parameter path fragments the client exposes. A fetched parameter is
    /// applicable when its id contains any listed fragment; an empty list
    /// makes every fetched parameter applicable.
    #[serde(default)]
    pub parameter_list: Vec<String>,
    /// Legacy identifier → current identifier.
    #[serde(default)]
    pub parameter_renames: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_parameter_metadata: BTreeMap<String, ParameterOverride>,
    #[serde(default)]
    pub extra_variable_metadata: BTreeMap<String, VariableOverride>,
    /// Household described before the user edits anything.
    #[serde(default)]
    pub default_situation: Value,
}

impl CountryProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let profile: Self =
            serde_json::from_str(text).map_err(|e| SchemaError::Profile(e.to_string()))?;
        profile.check()?;
        Ok(profile)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    fn check(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::Profile("name must not be empty".to_string()));
        }
        if let Some((from, _)) = self
            .parameter_renames
            .iter()
            .find(|(from, to)| from.is_empty() || to.is_empty())
        {
            return Err(SchemaError::Profile(format!(
                "rename `{}` has an empty side",
                from
            )));
        }
        Ok(())
    }

    pub fn is_applicable(&self, parameter_id: &str) -> bool {
        self.parameter_list.is_empty()
            || self
                .parameter_list
                .iter()
                .any(|fragment| parameter_id.contains(fragment.as_str()))
    }

    /// Keep only the applicable parameters of a fetched collection.
    pub fn filter_parameters(
        &self,
        fetched: BTreeMap<String, Parameter>,
    ) -> BTreeMap<String, Parameter> {
        let before = fetched.len();
        let kept: BTreeMap<_, _> = fetched
            .into_iter()
            .filter(|(id, _)| self.is_applicable(id))
            .collect();
        tracing::debug!(
            country = %self.name,
            fetched = before,
            applicable = kept.len(),
            "filtered fetched parameters"
        );
        kept
    }

    // ------------------------------------------------------------------------
    // Builders (mostly for tests and embedding)
    // ------------------------------------------------------------------------

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_parameter_list<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_list = fragments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.parameter_renames.insert(from.into(), to.into());
        self
    }

    pub fn with_default_situation(mut self, situation: Value) -> Self {
        self.default_situation = situation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_from_json() {
        let profile = CountryProfile::from_json_str(
            &json!({
                "name": "uk",
                "apiUrl": "https://example.org/uk/api",
                "parameterList": ["tax.income_tax"],
                "parameterRenames": {"old.benefit.name": "new.benefit.name"},
                "extraParameterMetadata": {"tax.income_tax.rate": {"label": "Rate", "max": 1}},
                "defaultSituation": {"people": {"you": {}}}
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(profile.api_url.as_deref(), Some("https://example.org/uk/api"));
        assert_eq!(profile.parameter_renames["old.benefit.name"], "new.benefit.name");
        assert_eq!(
            profile.extra_parameter_metadata["tax.income_tax.rate"].max,
            Some(1.0)
        );
        assert!(profile.extra_variable_metadata.is_empty());
    }

    #[test]
    fn profile_rejects_empty_name_and_renames() {
        assert!(CountryProfile::from_json_str(r#"{"name": ""}"#).is_err());
        assert!(CountryProfile::from_json_str(
            r#"{"name": "us", "parameterRenames": {"a": ""}}"#
        )
        .is_err());
        assert!(CountryProfile::from_json_str("not json").is_err());
    }

    #[test]
    fn applicability_is_substring_match() {
        let profile = CountryProfile::new("uk").with_parameter_list(["income_tax", "child_benefit"]);
        assert!(profile.is_applicable("tax.income_tax.rates.basic"));
        assert!(profile.is_applicable("benefit.child_benefit.amount.eldest"));
        assert!(!profile.is_applicable("tax.council_tax.band_d"));
        assert!(CountryProfile::new("us").is_applicable("anything.at.all"));
    }

    #[test]
    fn filter_parameters_drops_inapplicable() {
        let profile = CountryProfile::new("uk").with_parameter_list(["income_tax"]);
        let mut fetched = BTreeMap::new();
        for id in ["tax.income_tax.rate", "tax.council_tax.rate"] {
            fetched.insert(
                id.to_string(),
                Parameter::from_record(id, &json!({"defaultValue": 0.1})).unwrap(),
            );
        }
        let kept = profile.filter_parameters(fetched);
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["tax.income_tax.rate"]);
    }
}
