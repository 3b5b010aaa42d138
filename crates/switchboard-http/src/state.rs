//! State shared by every HTTP handler.

use switchboard_core::Conductor;

#[derive(Clone)]
pub struct SharedState {
    pub conductor: Conductor,
    /// Bearer token required on every route when set.
    pub auth_token: Option<String>,
}

impl SharedState {
    pub fn new(conductor: Conductor) -> Self {
        Self {
            conductor,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn validate_token(&self, token: Option<&str>) -> bool {
        match (&self.auth_token, token) {
            (None, _) => true,
            (Some(expected), Some(given)) => expected == given,
            (Some(_), None) => false,
        }
    }
}
