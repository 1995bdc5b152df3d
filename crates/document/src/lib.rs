pub mod document;
pub mod history;
pub mod settings;

pub use document::{Command, Document, DocumentError};
pub use history::{History, UndoAction};
pub use settings::{DocumentSettings, Locale, RecalcPolicy};
