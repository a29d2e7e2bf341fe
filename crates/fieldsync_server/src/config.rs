//! Server configuration.

use std::collections::BTreeMap;

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Fields that must be present and non-null, per resource type.
    pub required_fields: BTreeMap<String, Vec<String>>,
    /// Whether provisional ids are replaced with server-assigned ones.
    pub assign_ids: bool,
    /// Prefix marking a client-generated provisional id.
    pub provisional_prefix: String,
}

impl ServerConfig {
    /// Creates a configuration that assigns ids and validates nothing.
    pub fn new() -> Self {
        Self {
            required_fields: BTreeMap::new(),
            assign_ids: true,
            provisional_prefix: "temp-".to_string(),
        }
    }

    /// Requires `fields` on every stored record of `resource_type`.
    pub fn with_required_fields<I, S>(mut self, resource_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields.insert(
            resource_type.into(),
            fields.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Enables or disables id assignment.
    pub fn with_assign_ids(mut self, assign_ids: bool) -> Self {
        self.assign_ids = assign_ids;
        self
    }

    /// Sets the provisional id prefix.
    pub fn with_provisional_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.provisional_prefix = prefix.into();
        self
    }

    /// Required fields of a resource type.
    pub fn required_for(&self, resource_type: &str) -> &[String] {
        self.required_fields
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
