//! Reader positions and their registry.
//!
//! Slots are registered once per reader and keep their identifier for the
//! whole life of the pool, across any number of card insertions. A slot
//! owns the token of the card currently inserted, if any.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::TokenPolicy,
    error::{P11Error, P11Result, Resource},
    medium::{CardId, Medium, MediumError, ReaderDescriptor},
    session::SessionPool,
    token::{Token, TokenId},
};

pub type SlotId = u64;

/// Presence change observed by [`SlotPool::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Inserted(SlotId),
    Removed(SlotId),
}

impl SlotEvent {
    pub fn slot_id(&self) -> SlotId {
        match self {
            SlotEvent::Inserted(id) | SlotEvent::Removed(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub description: String,
    pub manufacturer: String,
    /// A card sits in the reader, recognized or not.
    pub token_present: bool,
    pub removable: bool,
    pub hardware: bool,
}

#[derive(Debug)]
struct SlotState {
    /// Card the slot was opened on; `None` while the slot is closed.
    card: Option<CardId>,
    token: Option<Arc<Token>>,
}

#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    reader: ReaderDescriptor,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(id: SlotId, reader: ReaderDescriptor) -> Self {
        Self {
            id,
            reader,
            state: Mutex::new(SlotState {
                card: None,
                token: None,
            }),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn reader(&self) -> &ReaderDescriptor {
        &self.reader
    }

    /// Card present in the reader.
    pub fn is_present(&self) -> bool {
        self.state.lock().card.is_some()
    }

    fn card(&self) -> Option<CardId> {
        self.state.lock().card
    }

    pub fn has_token(&self) -> bool {
        self.state.lock().token.is_some()
    }

    /// Token of the inserted card.
    pub fn token(&self) -> P11Result<Arc<Token>> {
        let state = self.state.lock();
        match (&state.token, state.card) {
            (Some(token), _) => Ok(Arc::clone(token)),
            (None, None) => Err(P11Error::TokenNotPresent(self.id)),
            (None, Some(_)) => Err(P11Error::TokenNotRecognized(self.id)),
        }
    }

    /// Read the card directory and install the resulting token. A card that
    /// cannot be read leaves the slot open but without a token.
    pub fn attach_token(
        &self,
        token_id: TokenId,
        medium: Arc<dyn Medium>,
        policy: TokenPolicy,
    ) -> P11Result<Arc<Token>> {
        let mut state = self.state.lock();
        if state.token.is_some() {
            return Err(P11Error::TokenAlreadyAttached(self.id));
        }
        state.card = match medium.card_identity(&self.reader) {
            Ok(card) => card,
            Err(MediumError::ReaderUnknown(_)) => None,
            Err(err) => return Err(err.into()),
        };
        if state.card.is_none() {
            return Err(P11Error::TokenNotPresent(self.id));
        }

        let token = match Token::materialize(token_id, self.id, self.reader.clone(), medium, policy)
        {
            Ok(token) => Arc::new(token),
            Err(err) => {
                warn!(slot = self.id, reader = %self.reader.name, error = %err, "token not recognized");
                return Err(err);
            }
        };
        state.token = Some(Arc::clone(&token));
        info!(slot = self.id, token = token_id, "token attached");
        Ok(token)
    }

    /// Destroy the token and invalidate its sessions. Returns false when no
    /// token was attached.
    pub fn detach_token(&self, sessions: &SessionPool) -> bool {
        let mut state = self.state.lock();
        state.card = None;
        let Some(token) = state.token.take() else {
            return false;
        };
        token.mark_removed();
        let closed = sessions.close_all_for_token(&token);
        info!(slot = self.id, token = token.id(), sessions = closed, "token detached");
        true
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            description: self.reader.description.clone(),
            manufacturer: self.reader.manufacturer.clone(),
            token_present: self.is_present(),
            removable: true,
            hardware: true,
        }
    }
}

#[derive(Debug)]
struct SlotTable {
    slots: Vec<Arc<Slot>>,
    next_id: SlotId,
}

#[derive(Debug)]
pub struct SlotPool {
    table: RwLock<SlotTable>,
    next_token_id: AtomicU64,
    max_slots: usize,
}

impl SlotPool {
    pub fn new(max_slots: usize) -> Self {
        Self::starting_at(max_slots, 0)
    }

    pub(crate) fn starting_at(max_slots: usize, next_id: SlotId) -> Self {
        Self {
            table: RwLock::new(SlotTable {
                slots: Vec::new(),
                next_id,
            }),
            next_token_id: AtomicU64::new(1),
            max_slots,
        }
    }

    pub fn register_slot(&self, reader: ReaderDescriptor) -> P11Result<SlotId> {
        let mut table = self.table.write();
        if table.slots.len() >= self.max_slots {
            return Err(P11Error::Capacity(Resource::Slots));
        }
        let id = table.next_id;
        table.next_id = id
            .checked_add(1)
            .ok_or(P11Error::Capacity(Resource::SlotIds))?;
        debug!(slot = id, reader = %reader.name, "slot registered");
        table.slots.push(Arc::new(Slot::new(id, reader)));
        Ok(id)
    }

    /// Slot identifiers in registration order. With `present_only`, only
    /// slots holding a token are listed.
    pub fn enumerate_slots(&self, present_only: bool) -> Vec<SlotId> {
        self.table
            .read()
            .slots
            .iter()
            .filter(|slot| !present_only || slot.has_token())
            .map(|slot| slot.id())
            .collect()
    }

    pub fn get_slot(&self, id: SlotId) -> P11Result<Arc<Slot>> {
        let table = self.table.read();
        table
            .slots
            .binary_search_by_key(&id, |slot| slot.id())
            .map(|index| Arc::clone(&table.slots[index]))
            .map_err(|_| P11Error::SlotIdInvalid(id))
    }

    pub fn slot_for_reader(&self, name: &str) -> Option<Arc<Slot>> {
        self.table
            .read()
            .slots
            .iter()
            .find(|slot| slot.reader().name == name)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.table.read().slots.clone()
    }

    /// The token `token_id` if it is still the one attached to `slot_id`.
    pub fn token_for(&self, slot_id: SlotId, token_id: TokenId) -> Option<Arc<Token>> {
        self.get_slot(slot_id)
            .and_then(|slot| slot.token())
            .ok()
            .filter(|token| token.id() == token_id)
    }

    pub fn attach(
        &self,
        slot_id: SlotId,
        medium: Arc<dyn Medium>,
        policy: TokenPolicy,
    ) -> P11Result<Arc<Token>> {
        let slot = self.get_slot(slot_id)?;
        let token_id = self.next_token_id.fetch_add(1, Ordering::Relaxed);
        slot.attach_token(token_id, medium, policy)
    }

    pub fn detach(&self, slot_id: SlotId, sessions: &SessionPool) -> P11Result<bool> {
        Ok(self.get_slot(slot_id)?.detach_token(sessions))
    }

    /// Detach every token, as on finalize.
    pub fn detach_all(&self, sessions: &SessionPool) {
        for slot in self.snapshot() {
            slot.detach_token(sessions);
        }
    }

    /// Register readers the medium reports for the first time, then poll
    /// card presence of every slot and attach or detach tokens to match. A
    /// card replaced between two polls is reported as a removal followed by
    /// an insertion.
    pub fn refresh(
        &self,
        medium: &Arc<dyn Medium>,
        sessions: &SessionPool,
        policy: TokenPolicy,
    ) -> P11Result<Vec<SlotEvent>> {
        for reader in medium.probe_readers()? {
            if self.slot_for_reader(&reader.name).is_none() {
                self.register_slot(reader)?;
            }
        }

        let mut events = Vec::new();
        for slot in self.snapshot() {
            let current = match medium.card_identity(slot.reader()) {
                Ok(card) => card,
                Err(MediumError::ReaderUnknown(_)) => None,
                Err(err) => {
                    warn!(slot = slot.id(), error = %err, "presence poll failed");
                    continue;
                }
            };
            let seen = slot.card();
            if current == seen {
                continue;
            }
            if seen.is_some() {
                if current.is_some() {
                    info!(slot = slot.id(), "card replaced between polls");
                }
                if slot.detach_token(sessions) {
                    events.push(SlotEvent::Removed(slot.id()));
                }
            }
            if current.is_some() {
                let token_id = self.next_token_id.fetch_add(1, Ordering::Relaxed);
                // Failures are logged by the slot; the slot stays open
                // and reports the card as unrecognized.
                if slot
                    .attach_token(token_id, Arc::clone(medium), policy)
                    .is_ok()
                {
                    events.push(SlotEvent::Inserted(slot.id()));
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        medium::{SoftCard, SoftMedium},
        session::SessionMode,
    };

    fn setup() -> (Arc<SoftMedium>, Arc<dyn Medium>, SlotPool, SessionPool) {
        let soft = Arc::new(SoftMedium::new());
        soft.add_reader("reader-0");
        soft.add_reader("reader-1");
        soft.insert_card("reader-0", SoftCard::new("card", b"1234", b"87654321"))
            .unwrap();
        let medium: Arc<dyn Medium> = soft.clone();
        (soft, medium, SlotPool::new(4), SessionPool::new(16))
    }

    #[test]
    fn refresh_registers_readers_and_attaches_cards() {
        let (_soft, medium, slots, sessions) = setup();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Inserted(0)]);
        assert_eq!(slots.enumerate_slots(false), vec![0, 1]);
        assert_eq!(slots.enumerate_slots(true), vec![0]);
        assert!(matches!(
            slots.get_slot(1).unwrap().token(),
            Err(P11Error::TokenNotPresent(1))
        ));
        assert!(matches!(slots.get_slot(9), Err(P11Error::SlotIdInvalid(9))));

        // A second poll without changes reports nothing.
        assert!(slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn slot_ids_survive_card_cycles() {
        let (soft, medium, slots, sessions) = setup();
        slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        let first = slots.get_slot(0).unwrap().token().unwrap();
        let handle = sessions.open(&first, SessionMode::ReadOnly).unwrap();

        let pulled = soft.remove_card("reader-0").unwrap();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Removed(0)]);
        assert!(first.is_removed());
        assert!(sessions.binding(handle).is_err());

        soft.insert_card("reader-0", pulled).unwrap();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Inserted(0)]);
        let second = slots.get_slot(0).unwrap().token().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(slots.token_for(0, first.id()).is_none());
        assert_eq!(slots.enumerate_slots(false), vec![0, 1]);
    }

    #[test]
    fn card_swapped_between_polls_is_reattached() {
        let (soft, medium, slots, sessions) = setup();
        slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        let first = slots.get_slot(0).unwrap().token().unwrap();
        let handle = sessions.open(&first, SessionMode::ReadOnly).unwrap();

        soft.remove_card("reader-0").unwrap();
        soft.insert_card("reader-0", SoftCard::new("other", b"9999", b"99999999"))
            .unwrap();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Removed(0), SlotEvent::Inserted(0)]);
        assert!(first.is_removed());
        assert!(sessions.binding(handle).is_err());

        let second = slots.get_slot(0).unwrap().token().unwrap();
        assert_eq!(second.label(), "other");
        assert_ne!(first.card_id(), second.card_id());
        assert!(slots.token_for(0, first.id()).is_none());
    }

    #[test]
    fn unrecognized_card_swap_attaches_replacement() {
        let (soft, medium, slots, sessions) = setup();
        soft.insert_card(
            "reader-1",
            SoftCard::new("broken", b"1234", b"87654321").unreadable(),
        )
        .unwrap();
        slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert!(matches!(
            slots.get_slot(1).unwrap().token(),
            Err(P11Error::TokenNotRecognized(1))
        ));

        soft.remove_card("reader-1").unwrap();
        soft.insert_card("reader-1", SoftCard::new("fixed", b"1234", b"87654321"))
            .unwrap();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Inserted(1)]);
        assert_eq!(slots.get_slot(1).unwrap().token().unwrap().label(), "fixed");
    }

    #[test]
    fn attach_rejects_occupied_slot() {
        let (_soft, medium, slots, sessions) = setup();
        slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert!(matches!(
            slots.attach(0, medium.clone(), TokenPolicy::default()),
            Err(P11Error::TokenAlreadyAttached(0))
        ));
        assert!(matches!(
            slots.attach(1, medium, TokenPolicy::default()),
            Err(P11Error::TokenNotPresent(1))
        ));
    }

    #[test]
    fn unreadable_card_is_not_recognized() {
        let (soft, medium, slots, sessions) = setup();
        soft.insert_card(
            "reader-1",
            SoftCard::new("broken", b"1234", b"87654321").unreadable(),
        )
        .unwrap();
        let events = slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert_eq!(events, vec![SlotEvent::Inserted(0)]);

        let slot = slots.get_slot(1).unwrap();
        assert!(slot.is_present());
        assert!(slot.info().token_present);
        assert!(matches!(slot.token(), Err(P11Error::TokenNotRecognized(1))));
    }

    #[test]
    fn detach_is_idempotent() {
        let (_soft, medium, slots, sessions) = setup();
        slots
            .refresh(&medium, &sessions, TokenPolicy::default())
            .unwrap();
        assert!(slots.detach(0, &sessions).unwrap());
        assert!(!slots.detach(0, &sessions).unwrap());
        assert!(!slots.detach(1, &sessions).unwrap());
    }

    #[test]
    fn capacity_limits() {
        let slots = SlotPool::new(1);
        slots.register_slot(ReaderDescriptor::new("a")).unwrap();
        assert!(matches!(
            slots.register_slot(ReaderDescriptor::new("b")),
            Err(P11Error::Capacity(Resource::Slots))
        ));

        let exhausted = SlotPool::starting_at(4, SlotId::MAX);
        assert!(matches!(
            exhausted.register_slot(ReaderDescriptor::new("c")),
            Err(P11Error::Capacity(Resource::SlotIds))
        ));
    }
}
