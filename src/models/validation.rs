use serde::{Deserialize, Serialize};

/// Outcome of running validation rules against a request.
///
/// `error_messages` holds every violation in rule-declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValidationCheckResult {
    pub action_result: bool,
    pub error_messages: Vec<String>,
}

impl ValidationCheckResult {
    pub fn passed() -> Self {
        Self {
            action_result: true,
            error_messages: Vec::new(),
        }
    }

    /// Build a result from collected violations; empty means pass.
    pub fn from_errors(error_messages: Vec<String>) -> Self {
        Self {
            action_result: error_messages.is_empty(),
            error_messages,
        }
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = String>) {
        self.error_messages.extend(errors);
        self.action_result = self.error_messages.is_empty();
    }
}

impl Default for ValidationCheckResult {
    fn default() -> Self {
        Self::passed()
    }
}
