use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    error::{P11Error, P11Result, Resource},
    object::{ObjectHandle, ObjectSearch},
    slot::SlotId,
    token::{LoginState, Token, TokenId},
};

pub type SessionHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    ReadOnly,
    ReadWrite,
}

/// Session state as reported by `C_GetSessionInfo` (CKS_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RoPublic,
    RoUser,
    RwPublic,
    RwUser,
    RwSecurityOfficer,
}

impl SessionState {
    /// Combine a session's mode with the shared login state of its token.
    pub fn derive(mode: SessionMode, login: LoginState) -> Self {
        match (mode, login) {
            (SessionMode::ReadOnly, LoginState::Public) => SessionState::RoPublic,
            // Read-only sessions cannot coexist with an SO login.
            (SessionMode::ReadOnly, _) => SessionState::RoUser,
            (SessionMode::ReadWrite, LoginState::Public) => SessionState::RwPublic,
            (SessionMode::ReadWrite, LoginState::User) => SessionState::RwUser,
            (SessionMode::ReadWrite, LoginState::SecurityOfficer) => {
                SessionState::RwSecurityOfficer
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: SlotId,
    pub mode: SessionMode,
    pub state: SessionState,
}

/// Where a session points. The token is looked up through the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    pub slot_id: SlotId,
    pub token_id: TokenId,
    pub mode: SessionMode,
}

#[derive(Debug)]
struct SessionRecord {
    binding: SessionBinding,
    search: Option<ObjectSearch>,
}

#[derive(Debug)]
struct SessionTable {
    sessions: HashMap<SessionHandle, SessionRecord>,
    next_handle: SessionHandle,
}

#[derive(Debug)]
pub struct SessionPool {
    table: RwLock<SessionTable>,
    max_sessions: usize,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self::starting_at(max_sessions, 1)
    }

    pub(crate) fn starting_at(max_sessions: usize, next_handle: SessionHandle) -> Self {
        Self {
            table: RwLock::new(SessionTable {
                sessions: HashMap::new(),
                next_handle,
            }),
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().sessions.is_empty()
    }

    /// Open a session on `token`. The token counts the session before the
    /// handle becomes visible.
    pub fn open(&self, token: &Token, mode: SessionMode) -> P11Result<SessionHandle> {
        let mut table = self.table.write();
        if table.sessions.len() >= self.max_sessions {
            return Err(P11Error::Capacity(Resource::Sessions));
        }
        let handle = table.next_handle;
        let next = handle
            .checked_add(1)
            .ok_or(P11Error::Capacity(Resource::SessionHandles))?;
        token.register_session(mode)?;
        table.next_handle = next;
        table.sessions.insert(
            handle,
            SessionRecord {
                binding: SessionBinding {
                    slot_id: token.slot_id(),
                    token_id: token.id(),
                    mode,
                },
                search: None,
            },
        );
        info!(session = handle, slot = token.slot_id(), ?mode, "session opened");
        Ok(handle)
    }

    pub fn binding(&self, handle: SessionHandle) -> P11Result<SessionBinding> {
        self.table
            .read()
            .sessions
            .get(&handle)
            .map(|record| record.binding)
            .ok_or(P11Error::SessionHandleInvalid(handle))
    }

    /// Close one session. `token` is the live token the session is bound
    /// to, if it still exists.
    pub fn close(&self, handle: SessionHandle, token: Option<&Token>) -> P11Result<()> {
        let mut table = self.table.write();
        let record = table
            .sessions
            .remove(&handle)
            .ok_or(P11Error::SessionHandleInvalid(handle))?;
        if let Some(token) = token.filter(|token| token.id() == record.binding.token_id) {
            token.release_session(record.binding.mode);
        }
        info!(session = handle, slot = record.binding.slot_id, "session closed");
        Ok(())
    }

    /// Close every session bound to `token`. Returns how many were closed.
    pub fn close_all_for_token(&self, token: &Token) -> usize {
        self.close_where(|binding| binding.token_id == token.id(), Some(token))
    }

    /// Close every session opened on `slot_id`.
    pub fn close_all_for_slot(&self, slot_id: SlotId, token: Option<&Token>) -> usize {
        self.close_where(|binding| binding.slot_id == slot_id, token)
    }

    /// Drop every session without touching token counters.
    pub fn close_all(&self) -> usize {
        let mut table = self.table.write();
        let closed = table.sessions.len();
        table.sessions.clear();
        if closed > 0 {
            info!(closed, "all sessions closed");
        }
        closed
    }

    fn close_where(
        &self,
        matches: impl Fn(&SessionBinding) -> bool,
        token: Option<&Token>,
    ) -> usize {
        let mut table = self.table.write();
        let mut closed = Vec::new();
        table.sessions.retain(|handle, record| {
            if matches(&record.binding) {
                closed.push((*handle, record.binding));
                false
            } else {
                true
            }
        });
        for (handle, binding) in &closed {
            if let Some(token) = token.filter(|token| token.id() == binding.token_id) {
                token.release_session(binding.mode);
            }
            debug!(session = handle, slot = binding.slot_id, "session closed");
        }
        closed.len()
    }

    pub fn find_init(&self, handle: SessionHandle, search: ObjectSearch) -> P11Result<()> {
        let mut table = self.table.write();
        let record = table
            .sessions
            .get_mut(&handle)
            .ok_or(P11Error::SessionHandleInvalid(handle))?;
        if record.search.is_some() {
            return Err(P11Error::OperationActive);
        }
        record.search = Some(search);
        Ok(())
    }

    pub fn find_next(&self, handle: SessionHandle, max: usize) -> P11Result<Vec<ObjectHandle>> {
        let mut table = self.table.write();
        let record = table
            .sessions
            .get_mut(&handle)
            .ok_or(P11Error::SessionHandleInvalid(handle))?;
        let search = record
            .search
            .as_mut()
            .ok_or(P11Error::OperationNotInitialized)?;
        Ok(search.next_batch(max))
    }

    pub fn find_final(&self, handle: SessionHandle) -> P11Result<()> {
        let mut table = self.table.write();
        let record = table
            .sessions
            .get_mut(&handle)
            .ok_or(P11Error::SessionHandleInvalid(handle))?;
        record
            .search
            .take()
            .map(|_| ())
            .ok_or(P11Error::OperationNotInitialized)
    }

    pub fn is_searching(&self, handle: SessionHandle) -> P11Result<bool> {
        self.table
            .read()
            .sessions
            .get(&handle)
            .map(|record| record.search.is_some())
            .ok_or(P11Error::SessionHandleInvalid(handle))
    }
}
