use chrono::Datelike;
use serde::{Deserialize, Serialize};

pub mod canonical;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compliance {
    Compliant,
    NonCompliant,
    Disabled,
    Pending,
}

impl Compliance {
    pub fn as_str(self) -> &'static str {
        match self {
            Compliance::Compliant => "Compliant",
            Compliance::NonCompliant => "NonCompliant",
            Compliance::Disabled => "Disabled",
            Compliance::Pending => "Pending",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Cluster {
    pub fn natural_key(&self) -> ClusterKey {
        ClusterKey {
            identifier: self.identifier.trim().to_string(),
        }
    }

    /// Display name to record, if one was supplied.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standards: Vec<String>,
}

impl ParentPolicy {
    pub fn natural_key(&self) -> ParentPolicyKey {
        ParentPolicyKey {
            name: self.name.trim().to_string(),
            namespace: self.namespace.trim().to_string(),
            categories: normalize_labels(&self.categories),
            controls: normalize_labels(&self.controls),
            standards: normalize_labels(&self.standards),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

impl Policy {
    pub fn spec_text(&self) -> Option<&str> {
        self.spec.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn supplied_spec_hash(&self) -> Option<&str> {
        self.spec_hash
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Sets `spec_hash` from the spec text when only the text was supplied.
    pub fn fill_spec_hash(&mut self) -> Result<(), canonical::MalformedInputError> {
        if let Some(hash) = self.supplied_spec_hash().map(str::to_string) {
            self.spec_hash = Some(hash);
            return Ok(());
        }
        if let Some(spec) = self.spec_text() {
            self.spec_hash = Some(canonical::hash_spec(spec)?);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<Compliance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_by: Option<String>,
}

/// One inbound compliance event, as posted by a reporting controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceEvent {
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_policy: Option<ParentPolicy>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub event: EventDetails,
}

impl ComplianceEvent {
    /// Checks everything that can be checked without the store. Every missing
    /// required field is reported in one message.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut missing = Vec::new();

        if self.cluster.identifier.trim().is_empty() {
            missing.push("cluster.identifier");
        }
        if let Some(parent) = &self.parent_policy {
            if parent.name.trim().is_empty() {
                missing.push("parentPolicy.name");
            }
            if parent.namespace.trim().is_empty() {
                missing.push("parentPolicy.namespace");
            }
        }
        if self.policy.name.trim().is_empty() {
            missing.push("policy.name");
        }
        if self.policy.namespace.trim().is_empty() {
            missing.push("policy.namespace");
        }
        if self.policy.spec_text().is_none() && self.policy.supplied_spec_hash().is_none() {
            missing.push("policy.spec or policy.specHash");
        }

        if !missing.is_empty() {
            return Err(ValidationError::new(format!(
                "required fields not provided: {}",
                missing.join(", ")
            )));
        }

        if let Some(field) = self.first_field_with_nul() {
            return Err(ValidationError::new(format!(
                "{field} must not contain NUL characters"
            )));
        }

        if let Some(hash) = self.policy.supplied_spec_hash()
            && !canonical::is_spec_hash(hash)
        {
            return Err(ValidationError::new(
                "policy.specHash must be 40 lowercase hex characters",
            ));
        }

        if let Some(spec) = self.policy.spec_text() {
            let computed = canonical::hash_spec(spec)
                .map_err(|_| ValidationError::new("policy.spec must be valid JSON"))?;
            if let Some(hash) = self.policy.supplied_spec_hash()
                && hash != computed
            {
                return Err(ValidationError::new(
                    "policy.specHash does not match the provided policy.spec",
                ));
            }
        }

        if let Some(timestamp) = self.event.timestamp.as_deref() {
            let parsed = chrono::DateTime::parse_from_rfc3339(timestamp.trim()).map_err(|_| {
                ValidationError::new("event.timestamp must be an RFC3339 timestamp")
            })?;
            // Postgres has no year zero.
            if parsed.year() < 1 {
                return Err(ValidationError::new(
                    "event.timestamp year must be 0001 or later",
                ));
            }
        }

        if let Some(metadata) = &self.event.metadata
            && !metadata.is_object()
        {
            return Err(ValidationError::new("event.metadata must be a JSON object"));
        }

        Ok(())
    }

    /// Postgres text and jsonb columns cannot hold NUL.
    fn first_field_with_nul(&self) -> Option<&'static str> {
        let has_nul = |s: &str| s.contains('\0');
        let opt_has_nul = |s: &Option<String>| s.as_deref().is_some_and(has_nul);
        let labels_have_nul = |labels: &[String]| labels.iter().any(|s| has_nul(s));

        let mut fields = vec![
            ("cluster.identifier", has_nul(&self.cluster.identifier)),
            ("cluster.name", opt_has_nul(&self.cluster.name)),
            ("policy.name", has_nul(&self.policy.name)),
            ("policy.namespace", has_nul(&self.policy.namespace)),
            ("policy.spec", opt_has_nul(&self.policy.spec)),
            ("policy.specHash", opt_has_nul(&self.policy.spec_hash)),
            ("event.message", opt_has_nul(&self.event.message)),
            ("event.timestamp", opt_has_nul(&self.event.timestamp)),
            ("event.reportedBy", opt_has_nul(&self.event.reported_by)),
            (
                "event.metadata",
                self.event.metadata.as_ref().is_some_and(json_has_nul),
            ),
        ];
        if let Some(parent) = &self.parent_policy {
            fields.extend([
                ("parentPolicy.name", has_nul(&parent.name)),
                ("parentPolicy.namespace", has_nul(&parent.namespace)),
                ("parentPolicy.categories", labels_have_nul(&parent.categories)),
                ("parentPolicy.controls", labels_have_nul(&parent.controls)),
                ("parentPolicy.standards", labels_have_nul(&parent.standards)),
            ]);
        }

        fields
            .into_iter()
            .find(|(_, bad)| *bad)
            .map(|(field, _)| field)
    }
}

fn json_has_nul(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains('\0'),
        serde_json::Value::Array(values) => values.iter().any(json_has_nul),
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains('\0') || json_has_nul(v)),
        _ => false,
    }
}

/// The persisted form of a [`ComplianceEvent`] with its resolved surrogate keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredComplianceEvent {
    pub event_id: i64,
    pub cluster_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_policy_id: Option<i64>,
    pub policy_id: i64,
    #[serde(flatten)]
    pub body: ComplianceEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParentPolicyKey {
    pub name: String,
    pub namespace: String,
    pub categories: Vec<String>,
    pub controls: Vec<String>,
    pub standards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub name: String,
    pub namespace: String,
    pub spec_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

fn normalize_labels(values: &[String]) -> Vec<String> {
    let mut out = values
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}
