use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Information about the environment a command was issued from.
///
/// Travels with every queued job so the handler runs with the same caller
/// identity the producer had. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default)]
    pub request_is_local: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for work the system issues on its own behalf.
    pub fn system() -> Self {
        Self::new().username("system").request_is_local(true)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn request_is_local(mut self, local: bool) -> Self {
        self.request_is_local = local;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn to_blob(&self) -> crate::core::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_blob(blob: &serde_json::Value) -> crate::core::Result<Self> {
        if blob.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(blob.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blob_keeps_extra_entries() {
        let ctx = AppContext::new()
            .id("42")
            .username("alice")
            .role("admin")
            .with("tenant", json!("acme"));

        let blob = ctx.to_blob().unwrap();
        assert_eq!(blob["username"], json!("alice"));
        assert_eq!(blob["tenant"], json!("acme"));

        let back = AppContext::from_blob(&blob).unwrap();
        assert_eq!(back, ctx);
        assert!(back.has_role("admin"));
    }

    #[test]
    fn test_null_blob_is_empty_context() {
        let ctx = AppContext::from_blob(&serde_json::Value::Null).unwrap();
        assert_eq!(ctx, AppContext::default());
    }
}
