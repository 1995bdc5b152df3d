//! Capability trait for submitting edits.
//!
//! UI adapters hold a `&mut dyn` or generic `CommandSink` and never touch
//! the document internals directly. The document crate provides the
//! canonical implementor.

/// Accepts edit commands and exposes the reversible-history entry points.
pub trait CommandSink {
    type Command;
    type Error;

    /// Apply a command, recording it in the undo history.
    fn submit(&mut self, cmd: Self::Command) -> Result<(), Self::Error>;

    /// Revert the most recent command. Returns false if there is nothing
    /// to undo (not an error).
    fn undo(&mut self) -> bool;

    /// Re-apply the most recently undone command. Returns false if there
    /// is nothing to redo.
    fn redo(&mut self) -> bool;
}
