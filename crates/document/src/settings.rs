//! Document-wide settings.

use serde::{Deserialize, Serialize};

/// When recalculation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalcPolicy {
    /// Recalculate at the end of every outermost operation.
    #[default]
    Automatic,
    /// Recalculate only on explicit request.
    Manual,
}

/// Locale used for persisted documents. Number parsing in the engine is
/// locale-independent ("." decimal separator); the locale travels with the
/// file for display layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    pub language: String,
}

impl Default for Locale {
    fn default() -> Self {
        Self {
            language: "en_US".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSettings {
    pub locale: Locale,
    pub recalc_policy: RecalcPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DocumentSettings::default();
        assert_eq!(settings.recalc_policy, RecalcPolicy::Automatic);
        assert_eq!(settings.locale.language, "en_US");
    }
}
