//! Action and field based relevance rules for built-in scenarios.

use serde::Deserialize;

use crate::model::{CdcAction, CollectedMessage};

fn default_actions() -> Vec<CdcAction> {
    vec![CdcAction::Changed]
}

/// Matches events by action and, for changes, by changed fields.
///
/// With `fields` set, a CHANGED event is relevant only when at least one of
/// the listed fields changed. CREATED and DELETED events match on action
/// alone.
///
/// # Examples
///
/// ```
/// use cdc_interceptor::model::CdcAction;
/// use cdc_interceptor::scenario::RelevanceFilter;
///
/// let filter = RelevanceFilter::new(vec![CdcAction::Created, CdcAction::Deleted]);
/// assert!(filter.accepts_action(CdcAction::Created));
/// assert!(!filter.accepts_action(CdcAction::Changed));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelevanceFilter {
    #[serde(default = "default_actions")]
    pub actions: Vec<CdcAction>,

    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self {
            actions: default_actions(),
            fields: None,
        }
    }
}

impl RelevanceFilter {
    pub fn new(actions: Vec<CdcAction>) -> Self {
        Self {
            actions,
            fields: None,
        }
    }

    /// Relevant for every action.
    pub fn all_actions() -> Self {
        Self::new(CdcAction::ALL.to_vec())
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn accepts_action(&self, action: CdcAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn matches(&self, message: &CollectedMessage) -> bool {
        if !self.accepts_action(message.action()) {
            return false;
        }
        match (&self.fields, message.action()) {
            (Some(fields), CdcAction::Changed) => fields.iter().any(|f| message.has_changed(f)),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{changed_message, created_message};

    #[test]
    fn test_default_matches_changes_only() {
        let filter = RelevanceFilter::default();
        assert!(filter.matches(&changed_message("orders", "1", 1, &[("status", "A", "B")])));
        assert!(!filter.matches(&created_message("orders", "1", 2, &[("status", "A")])));
    }

    #[test]
    fn test_fields_restrict_changes() {
        let filter = RelevanceFilter::default().with_fields(&["total"]);
        let status_only = changed_message("orders", "1", 1, &[("status", "A", "B")]);
        let total = changed_message("orders", "1", 2, &[("total", "1", "2")]);
        assert!(!filter.matches(&status_only));
        assert!(filter.matches(&total));
    }

    #[test]
    fn test_fields_ignored_for_creations() {
        let filter = RelevanceFilter::all_actions().with_fields(&["total"]);
        assert!(filter.matches(&created_message("orders", "1", 1, &[("status", "A")])));
    }

    #[test]
    fn test_deserialize_params() {
        let filter: RelevanceFilter =
            serde_json::from_value(serde_json::json!({"actions": ["created"], "fields": ["id"]}))
                .unwrap();
        assert_eq!(filter.actions, vec![CdcAction::Created]);
        assert_eq!(filter.fields, Some(vec!["id".to_string()]));

        let defaults: RelevanceFilter = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(defaults, RelevanceFilter::default());
    }
}
