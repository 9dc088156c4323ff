use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};

use crate::CoreError;

const USER_PREFIX: &str = "user:";
const SESSION_PREFIX: &str = "session:";
const MAX_SESSION_ID_LENGTH: usize = 36;

/// Owner of a file record and routing key for realtime notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    User(String),
    Session(String),
}

impl OwnerKey {
    /// Builds an owner from the two nullable ownership columns.
    /// Exactly one of them must be set.
    pub fn from_columns(
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<Self, CoreError> {
        match (non_empty(user_id), non_empty(session_id)) {
            (Some(user_id), None) => Ok(Self::User(user_id)),
            (None, Some(session_id)) => Ok(Self::Session(session_id)),
            _ => Err(CoreError::InvalidOwnership),
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        if let Some(user_id) = value.strip_prefix(USER_PREFIX) {
            return Self::from_columns(Some(user_id.to_owned()), None);
        }
        if let Some(session_id) = value.strip_prefix(SESSION_PREFIX) {
            return Self::from_columns(None, Some(session_id.to_owned()));
        }
        Err(CoreError::InvalidOwnership)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(user_id) => Some(user_id),
            Self::Session(_) => None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Session(session_id) => Some(session_id),
        }
    }
}

impl Display for OwnerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user_id) => write!(f, "{USER_PREFIX}{user_id}"),
            Self::Session(session_id) => write!(f, "{SESSION_PREFIX}{session_id}"),
        }
    }
}

impl Serialize for OwnerKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Identity resolved for one request: an authenticated subject, a client
/// session identifier, both, or neither (anonymous).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl CallerIdentity {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none() && self.session_id.is_none()
    }

    /// The key new records are owned by. An authenticated subject wins over a session.
    #[must_use]
    pub fn owner_key(&self) -> Option<OwnerKey> {
        if let Some(user_id) = &self.user_id {
            return Some(OwnerKey::User(user_id.clone()));
        }
        self.session_id
            .as_ref()
            .map(|session_id| OwnerKey::Session(session_id.clone()))
    }

    /// Ownership equality: the caller's subject matches a user-owned record or
    /// the caller's session matches a session-owned record.
    #[must_use]
    pub fn owns(&self, owner: &OwnerKey) -> bool {
        match owner {
            OwnerKey::User(user_id) => self.user_id.as_deref() == Some(user_id.as_str()),
            OwnerKey::Session(session_id) => {
                self.session_id.as_deref() == Some(session_id.as_str())
            }
        }
    }
}

/// Validates a client-chosen session identifier.
pub fn validate_session_id(value: &str) -> Result<&str, CoreError> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_SESSION_ID_LENGTH {
        return Err(CoreError::InvalidSessionId);
    }
    if !value
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-')
    {
        return Err(CoreError::InvalidSessionId);
    }
    Ok(value)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}
