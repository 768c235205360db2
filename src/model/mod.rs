//! Event model shared by every pipeline stage.
//!
//! - [`CdcAction`] classifies a change as created, deleted or changed
//! - [`FieldDelta`] holds one column's before/after values and change flags
//! - [`CollectedMessage`] is a decoded event; [`FilteredMessage`] is the
//!   shared form handed to the decide stage and scenarios
//! - [`MessageMeta`] records checkpoints, progress and the processing result

pub mod action;
pub mod message;
pub mod meta;
pub mod value;

pub use action::CdcAction;
pub use message::{CollectedMessage, FilteredMessage};
pub use meta::{MessageMeta, MetaHandle, ResultEntry, ResultLevel};
pub use value::{FieldDelta, FieldType, FieldValue};
