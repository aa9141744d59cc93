//! Entry point tying the slot and session pools to one medium.
//!
//! Every operation takes explicit slot or session identifiers. Sessions are
//! resolved to their token through the slot pool on each call, so a
//! session whose token has gone fails instead of acting on stale state.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    attributes::{AttributeId, AttributeSet, AttributeTemplate},
    config::ModuleConfig,
    error::{P11Error, P11Result},
    medium::{MechanismType, Medium},
    object::{AttributeLookup, ObjectHandle, ObjectSearch},
    session::{SessionBinding, SessionHandle, SessionInfo, SessionMode, SessionPool, SessionState},
    slot::{SlotEvent, SlotId, SlotInfo, SlotPool},
    token::{Token, TokenInfo, UserType},
};

pub const LIBRARY_VERSION: (u8, u8) = (0, 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    pub manufacturer: String,
    pub description: String,
    pub version: (u8, u8),
}

pub struct Context {
    info: LibraryInfo,
    config: ModuleConfig,
    medium: Arc<dyn Medium>,
    slots: SlotPool,
    sessions: SessionPool,
    pending_events: Mutex<VecDeque<SlotEvent>>,
}

impl Context {
    /// Build the pools and attach tokens for every card already present.
    pub fn initialize(config: ModuleConfig, medium: Arc<dyn Medium>) -> P11Result<Self> {
        let context = Self {
            info: LibraryInfo {
                manufacturer: config.manufacturer.clone(),
                description: config.library_description.clone(),
                version: LIBRARY_VERSION,
            },
            slots: SlotPool::new(config.max_slots),
            sessions: SessionPool::new(config.max_sessions),
            pending_events: Mutex::new(VecDeque::new()),
            medium,
            config,
        };
        context
            .slots
            .refresh(&context.medium, &context.sessions, context.config.policy)?;
        info!(
            slots = context.slots.enumerate_slots(false).len(),
            tokens = context.slots.enumerate_slots(true).len(),
            "context initialized"
        );
        Ok(context)
    }

    /// Destroy every token and session.
    pub fn finalize(&self) {
        self.slots.detach_all(&self.sessions);
        self.sessions.close_all();
        self.pending_events.lock().clear();
        info!("context finalized");
    }

    pub fn info(&self) -> &LibraryInfo {
        &self.info
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Poll the medium for reader and card changes. Events are also queued
    /// for [`Context::poll_slot_event`].
    pub fn refresh(&self) -> P11Result<Vec<SlotEvent>> {
        let events = self
            .slots
            .refresh(&self.medium, &self.sessions, self.config.policy)?;
        if !events.is_empty() {
            debug!(?events, "slot events");
            self.pending_events.lock().extend(events.iter().copied());
        }
        Ok(events)
    }

    pub fn slot_list(&self, present_only: bool) -> P11Result<Vec<SlotId>> {
        self.refresh()?;
        Ok(self.slots.enumerate_slots(present_only))
    }

    /// Oldest unreported slot event, without blocking.
    pub fn poll_slot_event(&self) -> P11Result<Option<SlotEvent>> {
        self.refresh()?;
        Ok(self.pending_events.lock().pop_front())
    }

    pub fn slot_info(&self, slot_id: SlotId) -> P11Result<SlotInfo> {
        Ok(self.slots.get_slot(slot_id)?.info())
    }

    fn slot_token(&self, slot_id: SlotId) -> P11Result<Arc<Token>> {
        self.slots.get_slot(slot_id)?.token()
    }

    pub fn token_info(&self, slot_id: SlotId) -> P11Result<TokenInfo> {
        self.slot_token(slot_id)?.info()
    }

    pub fn mechanisms(&self, slot_id: SlotId) -> P11Result<Vec<MechanismType>> {
        Ok(self.slot_token(slot_id)?.mechanisms().to_vec())
    }

    pub fn attach_token(&self, slot_id: SlotId) -> P11Result<()> {
        self.slots
            .attach(slot_id, Arc::clone(&self.medium), self.config.policy)
            .map(|_| ())
    }

    pub fn detach_token(&self, slot_id: SlotId) -> P11Result<bool> {
        self.slots.detach(slot_id, &self.sessions)
    }

    pub fn open_session(&self, slot_id: SlotId, mode: SessionMode) -> P11Result<SessionHandle> {
        let token = self.slot_token(slot_id)?;
        self.sessions.open(&token, mode)
    }

    pub fn close_session(&self, handle: SessionHandle) -> P11Result<()> {
        let binding = self.sessions.binding(handle)?;
        let token = self.slots.token_for(binding.slot_id, binding.token_id);
        self.sessions.close(handle, token.as_deref())
    }

    pub fn close_all_sessions(&self, slot_id: SlotId) -> P11Result<usize> {
        let slot = self.slots.get_slot(slot_id)?;
        let token = slot.token().ok();
        Ok(self.sessions.close_all_for_slot(slot_id, token.as_deref()))
    }

    /// Resolve a session to its binding and live token.
    fn session_token(&self, handle: SessionHandle) -> P11Result<(SessionBinding, Arc<Token>)> {
        let binding = self.sessions.binding(handle)?;
        let token = self
            .slots
            .token_for(binding.slot_id, binding.token_id)
            .ok_or(P11Error::DeviceRemoved(binding.slot_id))?;
        Ok((binding, token))
    }

    pub fn session_info(&self, handle: SessionHandle) -> P11Result<SessionInfo> {
        let (binding, token) = self.session_token(handle)?;
        Ok(SessionInfo {
            slot_id: binding.slot_id,
            mode: binding.mode,
            state: SessionState::derive(binding.mode, token.login_state()?),
        })
    }

    pub fn login(&self, handle: SessionHandle, role: UserType, credential: &[u8]) -> P11Result<()> {
        let (_, token) = self.session_token(handle)?;
        token.login(role, credential)
    }

    pub fn logout(&self, handle: SessionHandle) -> P11Result<()> {
        let (_, token) = self.session_token(handle)?;
        token.logout()
    }

    pub fn unblock(
        &self,
        handle: SessionHandle,
        so_credential: &[u8],
        new_user_credential: &[u8],
    ) -> P11Result<()> {
        let (_, token) = self.session_token(handle)?;
        token.unblock(so_credential, new_user_credential)
    }

    pub fn init_pin(&self, handle: SessionHandle, new_user_credential: &[u8]) -> P11Result<()> {
        let (binding, token) = self.session_token(handle)?;
        token.init_pin(binding.mode, new_user_credential)
    }

    pub fn set_pin(&self, handle: SessionHandle, old: &[u8], new: &[u8]) -> P11Result<()> {
        let (binding, token) = self.session_token(handle)?;
        token.set_pin(binding.mode, old, new)
    }

    /// Snapshot of visible objects matching `template`.
    pub fn find(&self, handle: SessionHandle, template: &AttributeTemplate) -> P11Result<ObjectSearch> {
        let (_, token) = self.session_token(handle)?;
        token.find(template)
    }

    pub fn find_init(&self, handle: SessionHandle, template: &AttributeTemplate) -> P11Result<()> {
        if self.sessions.is_searching(handle)? {
            return Err(P11Error::OperationActive);
        }
        let search = self.find(handle, template)?;
        self.sessions.find_init(handle, search)
    }

    pub fn find_next(&self, handle: SessionHandle, max: usize) -> P11Result<Vec<ObjectHandle>> {
        self.sessions.find_next(handle, max)
    }

    pub fn find_final(&self, handle: SessionHandle) -> P11Result<()> {
        self.sessions.find_final(handle)
    }

    pub fn create_object(
        &self,
        handle: SessionHandle,
        attributes: AttributeSet,
    ) -> P11Result<ObjectHandle> {
        let (binding, token) = self.session_token(handle)?;
        token.create_object(binding.mode, attributes)
    }

    pub fn destroy_object(&self, handle: SessionHandle, object: ObjectHandle) -> P11Result<()> {
        let (binding, token) = self.session_token(handle)?;
        token.destroy_object(binding.mode, object)
    }

    pub fn get_attributes(
        &self,
        handle: SessionHandle,
        object: ObjectHandle,
        requested: &[AttributeId],
    ) -> P11Result<Vec<AttributeLookup>> {
        let (_, token) = self.session_token(handle)?;
        token.get_attributes(object, requested)
    }

    pub fn set_attributes(
        &self,
        handle: SessionHandle,
        object: ObjectHandle,
        updates: &AttributeTemplate,
    ) -> P11Result<()> {
        let (binding, token) = self.session_token(handle)?;
        token.set_attributes(binding.mode, object, updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attributes::{AttributeValue, class, ids},
        medium::{SoftCard, SoftMedium, private_data_object},
        token::LoginState,
    };

    fn context() -> (Arc<SoftMedium>, Context) {
        let medium = Arc::new(SoftMedium::new());
        medium.add_reader("reader-0");
        medium
            .insert_card(
                "reader-0",
                SoftCard::new("card", b"1234", b"87654321")
                    .with_object(private_data_object("secret", b"x")),
            )
            .unwrap();
        let context = Context::initialize(ModuleConfig::default(), medium.clone()).unwrap();
        (medium, context)
    }

    #[test]
    fn login_is_shared_between_sessions() {
        let (_medium, ctx) = context();
        let ro = ctx.open_session(0, SessionMode::ReadOnly).unwrap();
        let rw = ctx.open_session(0, SessionMode::ReadWrite).unwrap();
        ctx.login(ro, UserType::User, b"1234").unwrap();

        assert_eq!(ctx.session_info(rw).unwrap().state, SessionState::RwUser);
        assert_eq!(ctx.session_info(ro).unwrap().state, SessionState::RoUser);
        ctx.logout(rw).unwrap();
        assert_eq!(ctx.session_info(ro).unwrap().state, SessionState::RoPublic);
    }

    #[test]
    fn find_cursor_through_context() {
        let (_medium, ctx) = context();
        let session = ctx.open_session(0, SessionMode::ReadWrite).unwrap();
        ctx.find_init(session, &AttributeTemplate::new()).unwrap();
        assert!(ctx.find_next(session, 10).unwrap().is_empty());
        assert!(matches!(
            ctx.find_init(session, &AttributeTemplate::new()),
            Err(P11Error::OperationActive)
        ));
        ctx.find_final(session).unwrap();

        ctx.login(session, UserType::User, b"1234").unwrap();
        let data = AttributeTemplate::new().with(ids::CLASS, AttributeValue::Uint(class::DATA));
        ctx.find_init(session, &data).unwrap();
        assert_eq!(ctx.find_next(session, 10).unwrap(), vec![1]);
        ctx.find_final(session).unwrap();
    }

    #[test]
    fn close_all_sessions_resets_login() {
        let (_medium, ctx) = context();
        let a = ctx.open_session(0, SessionMode::ReadWrite).unwrap();
        ctx.open_session(0, SessionMode::ReadWrite).unwrap();
        ctx.login(a, UserType::User, b"1234").unwrap();
        assert_eq!(ctx.close_all_sessions(0).unwrap(), 2);
        assert_eq!(ctx.token_info(0).unwrap().login, LoginState::Public);
        assert!(matches!(
            ctx.close_session(a),
            Err(P11Error::SessionHandleInvalid(_))
        ));
    }

    #[test]
    fn slot_events_are_queued() {
        let (medium, ctx) = context();
        assert_eq!(ctx.poll_slot_event().unwrap(), None);
        medium.remove_card("reader-0");
        assert_eq!(ctx.poll_slot_event().unwrap(), Some(SlotEvent::Removed(0)));
        assert_eq!(ctx.poll_slot_event().unwrap(), None);
        assert!(matches!(
            ctx.open_session(0, SessionMode::ReadOnly),
            Err(P11Error::TokenNotPresent(0))
        ));
    }

    #[test]
    fn finalize_drops_everything() {
        let (_medium, ctx) = context();
        let session = ctx.open_session(0, SessionMode::ReadOnly).unwrap();
        ctx.finalize();
        assert!(ctx.sessions().is_empty());
        assert!(matches!(
            ctx.session_info(session),
            Err(P11Error::SessionHandleInvalid(_))
        ));
        assert!(ctx.slots().enumerate_slots(true).is_empty());
    }

    #[test]
    fn library_info_comes_from_config() {
        let (_medium, ctx) = context();
        assert_eq!(ctx.info().manufacturer, "CardSlot");
        assert_eq!(ctx.info().version, LIBRARY_VERSION);
        assert!(ctx.mechanisms(0).unwrap().len() > 1);
    }
}
