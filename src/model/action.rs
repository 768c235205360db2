//! Change classification for CDC events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of row change an event carries.
///
/// Derived from which images (before/after) are present in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcAction {
    /// Row was inserted (after image only)
    Created,
    /// Row was deleted (before image only)
    Deleted,
    /// Row was updated (both images)
    Changed,
}

impl CdcAction {
    /// All actions, in declaration order.
    pub const ALL: [CdcAction; 3] = [CdcAction::Created, CdcAction::Deleted, CdcAction::Changed];

    /// Derives the action from the presence of before/after images.
    ///
    /// Returns `None` when neither image is present, which is not a
    /// valid change event.
    ///
    /// # Examples
    ///
    /// ```
    /// use cdc_interceptor::model::CdcAction;
    ///
    /// assert_eq!(CdcAction::from_presence(false, true), Some(CdcAction::Created));
    /// assert_eq!(CdcAction::from_presence(true, true), Some(CdcAction::Changed));
    /// assert_eq!(CdcAction::from_presence(false, false), None);
    /// ```
    pub fn from_presence(has_before: bool, has_after: bool) -> Option<Self> {
        match (has_before, has_after) {
            (false, true) => Some(Self::Created),
            (true, false) => Some(Self::Deleted),
            (true, true) => Some(Self::Changed),
            (false, false) => None,
        }
    }

    /// One-character symbol used in compact renderings.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Created => "+",
            Self::Deleted => "-",
            Self::Changed => "*",
        }
    }

    /// Upper-case name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Deleted => "DELETED",
            Self::Changed => "CHANGED",
        }
    }
}

impl fmt::Display for CdcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CdcAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "create" | "c" | "+" => Ok(Self::Created),
            "deleted" | "delete" | "d" | "-" => Ok(Self::Deleted),
            "changed" | "change" | "updated" | "u" | "*" => Ok(Self::Changed),
            other => Err(format!("unknown CDC action: {}", other)),
        }
    }
}
