pub mod native;

pub use native::{load, load_from_str, save, save_to_string, IoError, VersionDecision};
