//! Error types and stable error codes.

use std::fmt;

use crate::driver::SessionPhase;

/// A bootstrap field the join cannot proceed without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    CsrfToken,
    SessionToken,
    StaticToken,
    ElementId,
}

impl CredentialField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CsrfToken => "csrf_token",
            Self::SessionToken => "session_token",
            Self::StaticToken => "static_token",
            Self::ElementId => "element_id",
        }
    }
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("missing credential: {0}")]
    MissingCredential(CredentialField),

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("reply status mismatch: expected \"ok\", got {status:?}")]
    ReplyStatusMismatch { status: Option<String> },

    #[error("transport closed while {phase}")]
    Transport { phase: SessionPhase },
}

impl ChannelError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingCredential(_) => "missing_credential",
            Self::MalformedMessage { .. } => "malformed_message",
            Self::ReplyStatusMismatch { .. } => "reply_status_mismatch",
            Self::Transport { .. } => "transport",
        }
    }

    /// Whether the owning session has to stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReplyStatusMismatch { .. })
    }
}
