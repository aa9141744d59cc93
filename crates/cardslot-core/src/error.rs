use std::fmt;

use thiserror::Error;

use crate::{
    attributes::AttributeId,
    medium::MediumError,
    object::ObjectHandle,
    session::SessionHandle,
    slot::SlotId,
};

pub type P11Result<T> = Result<T, P11Error>;

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown slot, session, object or attribute identifier.
    NotFound,
    /// Operation disallowed by the current authentication or session mode.
    InvalidState,
    /// Token absent or removed while the call was in flight.
    Presence,
    /// Authentication failure.
    Credential,
    /// A pool or numbering space is exhausted.
    Capacity,
    /// The medium reported an unreadable or malformed directory.
    Medium,
}

/// Outcome of a rejected credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    /// Wrong credential; `remaining` attempts are left before the role locks.
    Incorrect { remaining: u8 },
    /// The retry budget is exhausted.
    Locked,
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialFailure::Incorrect { remaining } => {
                write!(f, "incorrect credential, {remaining} attempt(s) left")
            }
            CredentialFailure::Locked => write!(f, "credential locked"),
        }
    }
}

/// Numbering spaces and pools that can run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    SlotIds,
    Slots,
    Sessions,
    SessionHandles,
    ObjectNumbers,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::SlotIds => "slot identifier space",
            Resource::Slots => "slot pool",
            Resource::Sessions => "session pool",
            Resource::SessionHandles => "session handle space",
            Resource::ObjectNumbers => "object number space",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum P11Error {
    #[error("slot {0} does not exist")]
    SlotIdInvalid(SlotId),
    #[error("session {0} does not exist")]
    SessionHandleInvalid(SessionHandle),
    #[error("object {0} does not exist")]
    ObjectHandleInvalid(ObjectHandle),
    #[error("attribute {0:#x} is not valid for this object")]
    AttributeTypeInvalid(AttributeId),
    #[error("user already logged in")]
    AlreadyLoggedIn,
    #[error("another user is already logged in")]
    AnotherUserLoggedIn,
    #[error("user not logged in")]
    NotLoggedIn,
    #[error("session is read-only")]
    SessionReadOnly,
    #[error("a read-only session exists on the token")]
    SessionReadOnlyExists,
    #[error("the security officer is logged in on the token")]
    SessionReadWriteSoExists,
    #[error("slot {0} already holds a token")]
    TokenAlreadyAttached(SlotId),
    #[error("an object search is already active")]
    OperationActive,
    #[error("no object search is active")]
    OperationNotInitialized,
    #[error("attribute {0:#x} is read-only")]
    AttributeReadOnly(AttributeId),
    #[error("object cannot be modified or destroyed")]
    ActionProhibited,
    #[error("template is missing attribute {0:#x}")]
    TemplateIncomplete(AttributeId),
    #[error("PIN length out of range")]
    PinLenRange,
    #[error("no token present in slot {0}")]
    TokenNotPresent(SlotId),
    #[error("token in slot {0} was not recognized")]
    TokenNotRecognized(SlotId),
    #[error("token in slot {0} was removed")]
    DeviceRemoved(SlotId),
    #[error("credential rejected: {0}")]
    Credential(CredentialFailure),
    #[error("{0} exhausted")]
    Capacity(Resource),
    #[error("token initialization failed: {0}")]
    TokenInit(String),
    #[error("medium error: {0}")]
    Medium(#[from] MediumError),
}

impl P11Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            P11Error::SlotIdInvalid(_)
            | P11Error::SessionHandleInvalid(_)
            | P11Error::ObjectHandleInvalid(_)
            | P11Error::AttributeTypeInvalid(_) => ErrorKind::NotFound,
            P11Error::AlreadyLoggedIn
            | P11Error::AnotherUserLoggedIn
            | P11Error::NotLoggedIn
            | P11Error::SessionReadOnly
            | P11Error::SessionReadOnlyExists
            | P11Error::SessionReadWriteSoExists
            | P11Error::TokenAlreadyAttached(_)
            | P11Error::OperationActive
            | P11Error::OperationNotInitialized
            | P11Error::AttributeReadOnly(_)
            | P11Error::ActionProhibited
            | P11Error::TemplateIncomplete(_)
            | P11Error::PinLenRange => ErrorKind::InvalidState,
            P11Error::TokenNotPresent(_)
            | P11Error::TokenNotRecognized(_)
            | P11Error::DeviceRemoved(_) => ErrorKind::Presence,
            P11Error::Credential(_) => ErrorKind::Credential,
            P11Error::Capacity(_) => ErrorKind::Capacity,
            P11Error::TokenInit(_) | P11Error::Medium(_) => ErrorKind::Medium,
        }
    }

    pub fn token_init<E: fmt::Display>(err: E) -> Self {
        Self::TokenInit(err.to_string())
    }

    pub(crate) fn locked() -> Self {
        Self::Credential(CredentialFailure::Locked)
    }
}
