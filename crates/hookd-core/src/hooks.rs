//! Well-known hook identifiers and the dispatch policy each one uses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HOOK_ON_ACTIVATE: &str = "OnActivate";
pub const HOOK_ON_DEACTIVATE: &str = "OnDeactivate";
pub const HOOK_MESSAGE_WILL_BE_POSTED: &str = "MessageWillBePosted";
pub const HOOK_MESSAGE_WILL_BE_UPDATED: &str = "MessageWillBeUpdated";
pub const HOOK_MESSAGE_HAS_BEEN_POSTED: &str = "MessageHasBeenPosted";
pub const HOOK_MESSAGE_HAS_BEEN_UPDATED: &str = "MessageHasBeenUpdated";
pub const HOOK_FILE_WILL_BE_UPLOADED: &str = "FileWillBeUploaded";
pub const HOOK_USER_WILL_LOG_IN: &str = "UserWillLogIn";
pub const HOOK_USER_HAS_LOGGED_IN: &str = "UserHasLoggedIn";
pub const HOOK_USER_HAS_BEEN_CREATED: &str = "UserHasBeenCreated";

/// How a hook is fanned out across the extensions that declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Sequential transform-or-reject in registration order.
    Chained,
    /// Independent, possibly concurrent observation; results discarded.
    Notify,
    /// Invoked by the environment itself during activation/deactivation.
    Lifecycle,
}

impl DispatchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chained => "chained",
            Self::Notify => "notify",
            Self::Lifecycle => "lifecycle",
        }
    }
}

const HOOK_CATALOG: &[(&str, DispatchPolicy)] = &[
    (HOOK_ON_ACTIVATE, DispatchPolicy::Lifecycle),
    (HOOK_ON_DEACTIVATE, DispatchPolicy::Lifecycle),
    (HOOK_MESSAGE_WILL_BE_POSTED, DispatchPolicy::Chained),
    (HOOK_MESSAGE_WILL_BE_UPDATED, DispatchPolicy::Chained),
    (HOOK_FILE_WILL_BE_UPLOADED, DispatchPolicy::Chained),
    (HOOK_USER_WILL_LOG_IN, DispatchPolicy::Chained),
    (HOOK_MESSAGE_HAS_BEEN_POSTED, DispatchPolicy::Notify),
    (HOOK_MESSAGE_HAS_BEEN_UPDATED, DispatchPolicy::Notify),
    (HOOK_USER_HAS_LOGGED_IN, DispatchPolicy::Notify),
    (HOOK_USER_HAS_BEEN_CREATED, DispatchPolicy::Notify),
];

/// Returns the policy registered for a well-known hook id.
pub fn dispatch_policy_for(hook_id: &str) -> Option<DispatchPolicy> {
    HOOK_CATALOG
        .iter()
        .find(|(id, _)| *id == hook_id.trim())
        .map(|(_, policy)| *policy)
}

/// Returns every well-known hook id in catalog order.
pub fn known_hook_ids() -> impl Iterator<Item = &'static str> {
    HOOK_CATALOG.iter().map(|(id, _)| *id)
}

/// Reply an extension sends back from a chained hook.
///
/// A missing `value` leaves the candidate unchanged. A non-blank
/// `reject_reason` vetoes the operation and always wins over `value`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl HookResponse {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn replace(value: Value) -> Self {
        Self {
            value: Some(value),
            reject_reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            value: None,
            reject_reason: Some(reason.into()),
        }
    }

    /// Returns the rejection reason when one is present and non-blank.
    pub fn rejection(&self) -> Option<&str> {
        self.reject_reason
            .as_deref()
            .filter(|reason| !reason.trim().is_empty())
    }

    /// Parses the raw value returned by an extension. `null` means unchanged.
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        if raw.is_null() {
            return Ok(Self::unchanged());
        }
        serde_json::from_value(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::{dispatch_policy_for, known_hook_ids, DispatchPolicy, HookResponse};
    use serde_json::json;

    #[test]
    fn unit_dispatch_policy_for_classifies_catalog_hooks() {
        assert_eq!(
            dispatch_policy_for("MessageWillBePosted"),
            Some(DispatchPolicy::Chained)
        );
        assert_eq!(
            dispatch_policy_for(" MessageHasBeenPosted "),
            Some(DispatchPolicy::Notify)
        );
        assert_eq!(
            dispatch_policy_for("OnActivate"),
            Some(DispatchPolicy::Lifecycle)
        );
        assert_eq!(dispatch_policy_for("NoSuchHook"), None);
        assert_eq!(known_hook_ids().count(), 10);
    }

    #[test]
    fn unit_hook_response_rejection_ignores_blank_reasons() {
        assert_eq!(HookResponse::reject("no").rejection(), Some("no"));
        assert_eq!(HookResponse::reject("  ").rejection(), None);
        assert_eq!(HookResponse::unchanged().rejection(), None);
    }

    #[test]
    fn unit_hook_response_from_value_accepts_null_and_objects() {
        assert_eq!(
            HookResponse::from_value(json!(null)).expect("null"),
            HookResponse::unchanged()
        );
        let parsed = HookResponse::from_value(json!({"value": "x_a", "reject_reason": "no"}))
            .expect("object");
        assert_eq!(parsed.value, Some(json!("x_a")));
        assert_eq!(parsed.rejection(), Some("no"));
        assert!(HookResponse::from_value(json!("bare")).is_err());
    }
}
