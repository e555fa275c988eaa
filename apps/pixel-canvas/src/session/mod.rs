pub mod credentials;

use crate::model::Identity;

pub use credentials::{CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Passive record of who we are to the store and whether we are talking to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub identity: Option<Identity>,
    pub auth_token: Option<String>,
}

impl SessionState {
    pub fn connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn connected(&mut self, identity: Identity, token: String) {
        self.status = ConnectionStatus::Connected;
        self.identity = Some(identity);
        self.auth_token = Some(token);
    }

    /// Only the status is cleared; identity and token stay for the next resume.
    pub fn disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn forget_token(&mut self) {
        self.auth_token = None;
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_keeps_identity_and_token() {
        let identity = Identity::from_bytes([1; 32]);
        let mut state = SessionState::default();
        state.connecting();
        assert_eq!(state.status, ConnectionStatus::Connecting);
        state.connected(identity, "tok".into());
        assert!(state.is_connected());
        state.disconnected();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.identity, Some(identity));
        assert_eq!(state.auth_token.as_deref(), Some("tok"));
    }
}
