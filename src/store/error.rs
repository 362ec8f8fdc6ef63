use thiserror::Error;

/// Failure talking to the backing sheet
#[derive(Debug, Error)]
pub enum StoreError {
    /// Rate limit, timeout, server hiccup. Worth retrying.
    #[error("temporary sheet failure: {0}")]
    Transient(String),

    /// Credentials lack access. Retrying will not help.
    #[error("no permission to access the sheet: {0}")]
    Permission(String),

    #[error("unexpected sheet response: {0}")]
    Malformed(String),

    #[error("sheet backend misconfigured: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Text shown to the requester. Never includes raw backend detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            StoreError::Transient(_) => {
                "The request sheet is busy right now. Please try again later."
            }
            StoreError::Permission(_) => {
                "I don't have access to the request sheet. \
                 Please ask an admin to share it with the bot's service account."
            }
            StoreError::Malformed(_) | StoreError::Config(_) => {
                "Something went wrong. Please try again later."
            }
        }
    }
}
