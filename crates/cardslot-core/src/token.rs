//! Token state: authentication, session counters and the object inventory.
//!
//! All mutable state of a token sits behind one mutex so that every
//! transition (login, session registration, object changes, removal) is a
//! single critical section. Sessions never carry their own login flag;
//! they read the token's.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    attributes::{AttributeId, AttributeSet, AttributeTemplate, ids},
    config::TokenPolicy,
    error::{CredentialFailure, P11Error, P11Result},
    medium::{CardId, DirectoryEntry, MechanismType, Medium, MediumError, ReaderDescriptor},
    object::{
        AttributeLookup, ObjectHandle, ObjectSearch, ObjectStore, Visibility, apply_update,
        check_new_object, read_attribute,
    },
    pkcs15::decode_private_key_description,
    session::SessionMode,
    slot::SlotId,
};

/// Instance identifier; a re-attached card gets a new one.
pub type TokenId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserType {
    SecurityOfficer,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginState {
    #[default]
    Public,
    User,
    SecurityOfficer,
}

impl LoginState {
    pub fn role(self) -> Option<UserType> {
        match self {
            LoginState::Public => None,
            LoginState::User => Some(UserType::User),
            LoginState::SecurityOfficer => Some(UserType::SecurityOfficer),
        }
    }

    pub fn is_authenticated(self) -> bool {
        self != LoginState::Public
    }

    pub fn visibility(self) -> Visibility {
        match self {
            LoginState::Public => Visibility::PUBLIC,
            LoginState::User => Visibility::USER,
            LoginState::SecurityOfficer => Visibility::SECURITY_OFFICER,
        }
    }
}

impl From<UserType> for LoginState {
    fn from(role: UserType) -> Self {
        match role {
            UserType::User => LoginState::User,
            UserType::SecurityOfficer => LoginState::SecurityOfficer,
        }
    }
}

/// Usability of one role's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Usable { remaining: u8 },
    /// User PIN blocked until the security officer unblocks it.
    Locked,
    /// Security officer PIN exhausted for the lifetime of this token.
    Disabled,
}

/// Failed-attempt budget of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    role: UserType,
    limit: u8,
    remaining: u8,
}

impl RetryCounter {
    pub fn new(role: UserType, limit: u8) -> Self {
        Self {
            role,
            limit,
            remaining: limit,
        }
    }

    pub fn limit(&self) -> u8 {
        self.limit
    }

    pub fn remaining(&self) -> u8 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn status(&self) -> CredentialStatus {
        match (self.remaining, self.role) {
            (0, UserType::User) => CredentialStatus::Locked,
            (0, UserType::SecurityOfficer) => CredentialStatus::Disabled,
            (remaining, _) => CredentialStatus::Usable { remaining },
        }
    }

    fn record_failure(&mut self) -> CredentialFailure {
        self.remaining = self.remaining.saturating_sub(1);
        match self.remaining {
            0 => CredentialFailure::Locked,
            remaining => CredentialFailure::Incorrect { remaining },
        }
    }

    fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

/// Snapshot used for `C_GetTokenInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub login: LoginState,
    pub session_count: usize,
    pub rw_session_count: usize,
    pub min_pin_len: usize,
    pub max_pin_len: usize,
    pub user_pin: RetryCounter,
    pub so_pin: RetryCounter,
}

#[derive(Debug)]
struct TokenState {
    removed: bool,
    login: LoginState,
    user_pin: RetryCounter,
    so_pin: RetryCounter,
    rosessions: usize,
    rwsessions: usize,
    objects: ObjectStore,
}

impl TokenState {
    fn counter_mut(&mut self, role: UserType) -> &mut RetryCounter {
        match role {
            UserType::User => &mut self.user_pin,
            UserType::SecurityOfficer => &mut self.so_pin,
        }
    }
}

pub struct Token {
    id: TokenId,
    slot_id: SlotId,
    reader: ReaderDescriptor,
    card: CardId,
    label: String,
    manufacturer: String,
    model: String,
    serial: String,
    mechanisms: Vec<MechanismType>,
    medium: Arc<dyn Medium>,
    policy: TokenPolicy,
    state: Mutex<TokenState>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("slot_id", &self.slot_id)
            .field("card", &self.card)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Token {
    /// Build a token from the directory of the card in `reader`.
    pub fn materialize(
        id: TokenId,
        slot_id: SlotId,
        reader: ReaderDescriptor,
        medium: Arc<dyn Medium>,
        policy: TokenPolicy,
    ) -> P11Result<Self> {
        let card = match medium.card_identity(&reader) {
            Ok(Some(card)) => card,
            Ok(None) | Err(MediumError::CardAbsent(_)) => {
                return Err(P11Error::TokenNotPresent(slot_id));
            }
            Err(other) => return Err(P11Error::token_init(other)),
        };
        let directory = medium
            .read_token_directory(&reader)
            .map_err(|err| match err {
                MediumError::CardAbsent(_) => P11Error::TokenNotPresent(slot_id),
                other => P11Error::token_init(other),
            })?;

        let mut objects = ObjectStore::new();
        for entry in directory.entries {
            let attributes = match entry {
                DirectoryEntry::Object(attributes) => {
                    attributes
                        .validate_required(&[ids::CLASS])
                        .map_err(P11Error::token_init)?;
                    attributes
                }
                DirectoryEntry::PrivateKeyDescription(der) => decode_private_key_description(&der)
                    .map_err(|err| {
                        P11Error::token_init(MediumError::Malformed(err.to_string()))
                    })?
                    .to_attributes(),
            };
            objects.insert(attributes)?;
        }

        info!(
            slot = slot_id,
            token = id,
            card,
            label = %directory.label,
            objects = objects.len(),
            "token materialized"
        );
        Ok(Self {
            id,
            slot_id,
            reader,
            card,
            label: directory.label,
            manufacturer: directory.manufacturer,
            model: directory.model,
            serial: directory.serial,
            mechanisms: directory.mechanisms,
            medium,
            state: Mutex::new(TokenState {
                removed: false,
                login: LoginState::Public,
                user_pin: RetryCounter::new(UserType::User, policy.user_retry_limit),
                so_pin: RetryCounter::new(UserType::SecurityOfficer, policy.so_retry_limit),
                rosessions: 0,
                rwsessions: 0,
                objects,
            }),
            policy,
        })
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Card insertion this token was read from.
    pub fn card_id(&self) -> CardId {
        self.card
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mechanisms(&self) -> &[MechanismType] {
        &self.mechanisms
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn login_state(&self) -> P11Result<LoginState> {
        Ok(self.lock_live()?.login)
    }

    /// Lock the state of a token whose card is still in the reader. A
    /// pulled or replaced card fails with a presence error even before the
    /// next refresh detaches the token.
    fn lock_live(&self) -> P11Result<MutexGuard<'_, TokenState>> {
        let state = self.state.lock();
        if state.removed {
            return Err(P11Error::DeviceRemoved(self.slot_id));
        }
        match self.medium.card_identity(&self.reader) {
            Ok(Some(card)) if card == self.card => Ok(state),
            Ok(_) | Err(MediumError::ReaderUnknown(_) | MediumError::CardAbsent(_)) => {
                debug!(slot = self.slot_id, token = self.id, "card no longer in reader");
                Err(P11Error::DeviceRemoved(self.slot_id))
            }
            Err(other) => Err(P11Error::Medium(other)),
        }
    }

    fn medium_error(&self, err: MediumError) -> P11Error {
        match err {
            MediumError::CardAbsent(_) => P11Error::DeviceRemoved(self.slot_id),
            other => P11Error::Medium(other),
        }
    }

    fn check_pin_len(&self, credential: &[u8]) -> P11Result<()> {
        if (self.policy.min_pin_len..=self.policy.max_pin_len).contains(&credential.len()) {
            Ok(())
        } else {
            Err(P11Error::PinLenRange)
        }
    }

    /// Check `credential` for `role` against its retry counter. The caller
    /// holds the state lock, so the counter and the outcome change together.
    fn verify(
        &self,
        state: &mut TokenState,
        role: UserType,
        credential: &[u8],
    ) -> P11Result<()> {
        if state.counter_mut(role).is_exhausted() {
            return Err(P11Error::locked());
        }
        let accepted = self
            .medium
            .check_credential(&self.reader, role, credential)
            .map_err(|err| self.medium_error(err))?;
        let counter = state.counter_mut(role);
        if accepted {
            counter.reset();
            return Ok(());
        }
        let failure = counter.record_failure();
        warn!(slot = self.slot_id, token = self.id, ?role, %failure, "credential rejected");
        Err(P11Error::Credential(failure))
    }

    pub fn login(&self, role: UserType, credential: &[u8]) -> P11Result<()> {
        let mut state = self.lock_live()?;
        match state.login.role() {
            None => {}
            Some(current) if current == role => return Err(P11Error::AlreadyLoggedIn),
            Some(_) => return Err(P11Error::AnotherUserLoggedIn),
        }
        if role == UserType::SecurityOfficer && state.rosessions > 0 {
            return Err(P11Error::SessionReadOnlyExists);
        }
        self.verify(&mut state, role, credential)?;
        state.login = role.into();
        info!(slot = self.slot_id, token = self.id, ?role, "logged in");
        Ok(())
    }

    pub fn logout(&self) -> P11Result<()> {
        let mut state = self.lock_live()?;
        if !state.login.is_authenticated() {
            return Err(P11Error::NotLoggedIn);
        }
        state.login = LoginState::Public;
        info!(slot = self.slot_id, token = self.id, "logged out");
        Ok(())
    }

    /// Reset the user credential with the security officer's credential.
    pub fn unblock(&self, so_credential: &[u8], new_user_credential: &[u8]) -> P11Result<()> {
        let mut state = self.lock_live()?;
        self.check_pin_len(new_user_credential)?;
        self.verify(&mut state, UserType::SecurityOfficer, so_credential)?;
        self.replace_user_credential(&mut state, new_user_credential)?;
        info!(slot = self.slot_id, token = self.id, "user credential unblocked");
        Ok(())
    }

    /// `C_InitPIN`: the logged-in security officer sets a new user credential.
    pub fn init_pin(&self, mode: SessionMode, new_user_credential: &[u8]) -> P11Result<()> {
        let mut state = self.lock_live()?;
        if mode == SessionMode::ReadOnly {
            return Err(P11Error::SessionReadOnly);
        }
        if state.login != LoginState::SecurityOfficer {
            return Err(P11Error::NotLoggedIn);
        }
        self.check_pin_len(new_user_credential)?;
        self.replace_user_credential(&mut state, new_user_credential)?;
        info!(slot = self.slot_id, token = self.id, "user credential initialized");
        Ok(())
    }

    /// `C_SetPIN`: change the credential of the logged-in role, or of the
    /// user when nobody is logged in.
    pub fn set_pin(&self, mode: SessionMode, old: &[u8], new: &[u8]) -> P11Result<()> {
        let mut state = self.lock_live()?;
        if mode == SessionMode::ReadOnly {
            return Err(P11Error::SessionReadOnly);
        }
        let role = state.login.role().unwrap_or(UserType::User);
        self.check_pin_len(new)?;
        self.verify(&mut state, role, old)?;
        self.medium
            .store_credential(&self.reader, role, new)
            .map_err(|err| self.medium_error(err))?;
        info!(slot = self.slot_id, token = self.id, ?role, "credential changed");
        Ok(())
    }

    fn replace_user_credential(&self, state: &mut TokenState, credential: &[u8]) -> P11Result<()> {
        self.medium
            .store_credential(&self.reader, UserType::User, credential)
            .map_err(|err| self.medium_error(err))?;
        state.user_pin.reset();
        Ok(())
    }

    /// Count a new session. Read-only sessions are refused while the
    /// security officer is logged in.
    pub(crate) fn register_session(&self, mode: SessionMode) -> P11Result<()> {
        let mut state = self.lock_live()?;
        match mode {
            SessionMode::ReadOnly => {
                if state.login == LoginState::SecurityOfficer {
                    return Err(P11Error::SessionReadWriteSoExists);
                }
                state.rosessions += 1;
            }
            SessionMode::ReadWrite => state.rwsessions += 1,
        }
        Ok(())
    }

    /// Drop a session from the counters. Closing the last one logs out.
    pub(crate) fn release_session(&self, mode: SessionMode) {
        let mut state = self.state.lock();
        match mode {
            SessionMode::ReadOnly => state.rosessions = state.rosessions.saturating_sub(1),
            SessionMode::ReadWrite => state.rwsessions = state.rwsessions.saturating_sub(1),
        }
        if state.rosessions == 0 && state.rwsessions == 0 && state.login.is_authenticated() {
            state.login = LoginState::Public;
            debug!(slot = self.slot_id, token = self.id, "last session closed, logged out");
        }
    }

    /// Mark the token gone. Operations already waiting on the lock fail
    /// with a presence error once they acquire it.
    pub(crate) fn mark_removed(&self) -> bool {
        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.removed = true;
        state.login = LoginState::Public;
        state.objects = ObjectStore::new();
        info!(slot = self.slot_id, token = self.id, "token removed");
        true
    }

    pub fn find(&self, template: &AttributeTemplate) -> P11Result<ObjectSearch> {
        let state = self.lock_live()?;
        let handles = state.objects.search(template, state.login.visibility());
        debug!(token = self.id, matches = handles.len(), "object search");
        Ok(ObjectSearch::new(handles))
    }

    pub fn create_object(
        &self,
        mode: SessionMode,
        attributes: AttributeSet,
    ) -> P11Result<ObjectHandle> {
        let mut state = self.lock_live()?;
        if mode == SessionMode::ReadOnly {
            return Err(P11Error::SessionReadOnly);
        }
        if !state.login.is_authenticated() {
            return Err(P11Error::NotLoggedIn);
        }
        check_new_object(&attributes, state.login.visibility())?;
        let handle = state.objects.insert(attributes)?;
        debug!(token = self.id, object = handle, "object created");
        Ok(handle)
    }

    pub fn destroy_object(&self, mode: SessionMode, handle: ObjectHandle) -> P11Result<()> {
        let mut state = self.lock_live()?;
        if mode == SessionMode::ReadOnly {
            return Err(P11Error::SessionReadOnly);
        }
        let visibility = state.login.visibility();
        let attributes = state
            .objects
            .get(handle, visibility)
            .ok_or(P11Error::ObjectHandleInvalid(handle))?;
        if attributes.flag(ids::DESTROYABLE) == Some(false) {
            return Err(P11Error::ActionProhibited);
        }
        state.objects.remove(handle, visibility);
        debug!(token = self.id, object = handle, "object destroyed");
        Ok(())
    }

    pub fn get_attributes(
        &self,
        handle: ObjectHandle,
        requested: &[AttributeId],
    ) -> P11Result<Vec<AttributeLookup>> {
        let state = self.lock_live()?;
        let visibility = state.login.visibility();
        let attributes = state
            .objects
            .get(handle, visibility)
            .ok_or(P11Error::ObjectHandleInvalid(handle))?;
        Ok(requested
            .iter()
            .map(|id| read_attribute(attributes, *id, visibility))
            .collect())
    }

    pub fn set_attributes(
        &self,
        mode: SessionMode,
        handle: ObjectHandle,
        updates: &AttributeTemplate,
    ) -> P11Result<()> {
        let mut state = self.lock_live()?;
        if mode == SessionMode::ReadOnly {
            return Err(P11Error::SessionReadOnly);
        }
        let visibility = state.login.visibility();
        let attributes = state
            .objects
            .get_mut(handle, visibility)
            .ok_or(P11Error::ObjectHandleInvalid(handle))?;
        apply_update(attributes, updates, visibility)
    }

    pub fn info(&self) -> P11Result<TokenInfo> {
        let state = self.lock_live()?;
        Ok(TokenInfo {
            label: self.label.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            serial: self.serial.clone(),
            login: state.login,
            session_count: state.rosessions + state.rwsessions,
            rw_session_count: state.rwsessions,
            min_pin_len: self.policy.min_pin_len,
            max_pin_len: self.policy.max_pin_len,
            user_pin: state.user_pin,
            so_pin: state.so_pin,
        })
    }
}
