use serde::{Deserialize, Serialize};

/// Per-request values threaded through every hook invocation so extensions
/// can correlate a call with the request that triggered it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookContext {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub accept_language: String,
    #[serde(default)]
    pub user_agent: String,
}

impl HookContext {
    /// Context for calls that do not originate from a user request, such as
    /// lifecycle hooks or scheduled maintenance.
    pub fn system(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Returns true when no identifying field is populated.
    pub fn is_empty(&self) -> bool {
        self.session_id.is_empty()
            && self.request_id.is_empty()
            && self.ip_address.is_empty()
            && self.accept_language.is_empty()
            && self.user_agent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::HookContext;

    #[test]
    fn unit_hook_context_deserializes_missing_fields_as_empty() {
        let context: HookContext =
            serde_json::from_str(r#"{"session_id":"s1"}"#).expect("parse context");
        assert_eq!(context.session_id, "s1");
        assert!(context.request_id.is_empty());
        assert!(!context.is_empty());
        assert!(HookContext::default().is_empty());
    }

    #[test]
    fn unit_hook_context_system_only_sets_request_id() {
        let context = HookContext::system("maintenance");
        assert_eq!(context.request_id, "maintenance");
        assert!(context.session_id.is_empty());
        assert!(context.user_agent.is_empty());
    }
}
