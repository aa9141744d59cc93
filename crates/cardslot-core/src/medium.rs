//! Boundary with the card driver.
//!
//! The core never talks to hardware directly. Everything it needs from a
//! reader (presence, the object directory, credential checks) goes through
//! the [`Medium`] trait. [`SoftMedium`] is an in-memory implementation with
//! virtual cards that can be inserted and pulled at runtime.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    attributes::{AttributeSet, AttributeValue, class, ids},
    config::{ModuleConfig, SoftCardConfig},
    token::UserType,
};

pub type MechanismType = u64;
/// Identity of one card insertion. A card pulled and put back, or replaced
/// by another, reports a different identity.
pub type CardId = u64;
pub type MediumResult<T> = Result<T, MediumError>;

/// Mechanism identifiers (CKM_*) advertised by the virtual cards.
pub mod mechanisms {
    use super::MechanismType;

    pub const RSA_PKCS_KEY_PAIR_GEN: MechanismType = 0x0000;
    pub const RSA_PKCS: MechanismType = 0x0001;
    pub const RSA_PKCS_PSS: MechanismType = 0x000D;
    pub const SHA256_RSA_PKCS: MechanismType = 0x0040;
    pub const EC_KEY_PAIR_GEN: MechanismType = 0x1040;
    pub const ECDSA: MechanismType = 0x1041;
    pub const ECDSA_SHA256: MechanismType = 0x1044;
    pub const ECDH1_DERIVE: MechanismType = 0x1050;

    pub const DEFAULT: &[MechanismType] = &[
        RSA_PKCS_KEY_PAIR_GEN,
        RSA_PKCS,
        RSA_PKCS_PSS,
        SHA256_RSA_PKCS,
        EC_KEY_PAIR_GEN,
        ECDSA,
        ECDSA_SHA256,
        ECDH1_DERIVE,
    ];
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediumError {
    #[error("reader {0} is unknown")]
    ReaderUnknown(String),
    #[error("no card in reader {0}")]
    CardAbsent(String),
    #[error("reader {0} already holds a card")]
    ReaderOccupied(String),
    #[error("card directory unreadable: {0}")]
    Unreadable(String),
    #[error("card directory malformed: {0}")]
    Malformed(String),
}

/// Physical or logical reader position reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderDescriptor {
    pub name: String,
    pub description: String,
    pub manufacturer: String,
}

impl ReaderDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            manufacturer: "CardSlot".to_string(),
        }
    }
}

/// One entry of a card's object directory.
#[derive(Debug, Clone)]
pub enum DirectoryEntry {
    /// Object already expressed as PKCS#11 attributes.
    Object(AttributeSet),
    /// DER encoded PKCS#15 private key description.
    PrivateKeyDescription(Vec<u8>),
}

/// Everything the core learns from a card when it is inserted.
#[derive(Debug, Clone, Default)]
pub struct TokenDirectory {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub mechanisms: Vec<MechanismType>,
    pub entries: Vec<DirectoryEntry>,
}

pub trait Medium: Send + Sync {
    /// Readers currently known to the driver.
    fn probe_readers(&self) -> MediumResult<Vec<ReaderDescriptor>>;

    /// Identity of the card in `reader`, `None` when the reader is empty.
    fn card_identity(&self, reader: &ReaderDescriptor) -> MediumResult<Option<CardId>>;

    /// Read the object directory of the card in `reader`. Called once per
    /// insertion.
    fn read_token_directory(&self, reader: &ReaderDescriptor) -> MediumResult<TokenDirectory>;

    /// Verify `credential` for `role` on the card itself.
    fn check_credential(
        &self,
        reader: &ReaderDescriptor,
        role: UserType,
        credential: &[u8],
    ) -> MediumResult<bool>;

    /// Replace the credential of `role` on the card.
    fn store_credential(
        &self,
        reader: &ReaderDescriptor,
        role: UserType,
        credential: &[u8],
    ) -> MediumResult<()>;
}

fn hash_credential(credential: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(credential);
    hasher.finalize().to_vec()
}

/// Virtual card held by a [`SoftMedium`] reader.
#[derive(Debug, Clone)]
pub struct SoftCard {
    directory: TokenDirectory,
    user_hash: Vec<u8>,
    so_hash: Vec<u8>,
    unreadable: bool,
}

impl SoftCard {
    pub fn new(label: &str, user_pin: &[u8], so_pin: &[u8]) -> Self {
        Self {
            directory: TokenDirectory {
                label: label.to_string(),
                manufacturer: "CardSlot".to_string(),
                model: "SoftCard".to_string(),
                serial: "0000000000000001".to_string(),
                mechanisms: mechanisms::DEFAULT.to_vec(),
                entries: Vec::new(),
            },
            user_hash: hash_credential(user_pin),
            so_hash: hash_credential(so_pin),
            unreadable: false,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.directory.serial = serial.to_string();
        self
    }

    pub fn with_object(mut self, attributes: AttributeSet) -> Self {
        self.directory
            .entries
            .push(DirectoryEntry::Object(attributes));
        self
    }

    pub fn with_private_key_description(mut self, der: Vec<u8>) -> Self {
        self.directory
            .entries
            .push(DirectoryEntry::PrivateKeyDescription(der));
        self
    }

    /// Make directory reads fail, as a damaged or foreign card would.
    pub fn unreadable(mut self) -> Self {
        self.unreadable = true;
        self
    }

    fn from_config(config: &SoftCardConfig) -> Self {
        let mut card = SoftCard::new(
            &config.label,
            config.user_pin.as_bytes(),
            config.so_pin.as_bytes(),
        )
        .with_serial(&config.serial);
        for object in &config.objects {
            let mut attributes = AttributeSet::new()
                .with(ids::CLASS, AttributeValue::Uint(object.class.code()))
                .with(ids::TOKEN, AttributeValue::Bool(true))
                .with(ids::LABEL, AttributeValue::Bytes(object.label.as_bytes().to_vec()));
            if let Some(private) = object.private {
                attributes.insert(ids::PRIVATE, AttributeValue::Bool(private));
            }
            if let Some(value) = &object.value {
                attributes.insert(ids::VALUE, AttributeValue::Bytes(value.as_bytes().to_vec()));
            }
            card = card.with_object(attributes);
        }
        card
    }
}

#[derive(Debug)]
struct SoftReader {
    descriptor: ReaderDescriptor,
    card: Option<(CardId, SoftCard)>,
}

/// In-memory medium used by tests and as the default backing of the module.
#[derive(Debug, Default)]
pub struct SoftMedium {
    readers: RwLock<BTreeMap<String, SoftReader>>,
    insertions: AtomicU64,
}

impl SoftMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build readers and cards from the `readers` section of the configuration.
    pub fn from_config(config: &ModuleConfig) -> Self {
        let medium = Self::new();
        for reader in &config.readers {
            medium.add_reader(&reader.name);
            if let Some(card) = &reader.card {
                if let Err(err) = medium.insert_card(&reader.name, SoftCard::from_config(card)) {
                    warn!(reader = %reader.name, error = %err, "virtual card not inserted");
                }
            }
        }
        medium
    }

    pub fn add_reader(&self, name: &str) -> ReaderDescriptor {
        let descriptor = ReaderDescriptor::new(name);
        self.readers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| SoftReader {
                descriptor: descriptor.clone(),
                card: None,
            });
        descriptor
    }

    /// Put `card` into an empty `reader` and return the identity of the
    /// insertion.
    pub fn insert_card(&self, reader: &str, card: SoftCard) -> MediumResult<CardId> {
        let mut readers = self.readers.write();
        let slot = readers
            .get_mut(reader)
            .ok_or_else(|| MediumError::ReaderUnknown(reader.to_string()))?;
        if slot.card.is_some() {
            return Err(MediumError::ReaderOccupied(reader.to_string()));
        }
        let id = self.insertions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(reader, card = id, label = %card.directory.label, "virtual card inserted");
        slot.card = Some((id, card));
        Ok(id)
    }

    pub fn remove_card(&self, reader: &str) -> Option<SoftCard> {
        let (id, card) = self.readers.write().get_mut(reader)?.card.take()?;
        debug!(reader, card = id, "virtual card removed");
        Some(card)
    }

    fn with_card<T>(
        &self,
        reader: &ReaderDescriptor,
        f: impl FnOnce(&SoftCard) -> MediumResult<T>,
    ) -> MediumResult<T> {
        let readers = self.readers.read();
        let entry = readers
            .get(&reader.name)
            .ok_or_else(|| MediumError::ReaderUnknown(reader.name.clone()))?;
        let (_, card) = entry
            .card
            .as_ref()
            .ok_or_else(|| MediumError::CardAbsent(reader.name.clone()))?;
        f(card)
    }
}

impl Medium for SoftMedium {
    fn probe_readers(&self) -> MediumResult<Vec<ReaderDescriptor>> {
        Ok(self
            .readers
            .read()
            .values()
            .map(|reader| reader.descriptor.clone())
            .collect())
    }

    fn card_identity(&self, reader: &ReaderDescriptor) -> MediumResult<Option<CardId>> {
        let readers = self.readers.read();
        let entry = readers
            .get(&reader.name)
            .ok_or_else(|| MediumError::ReaderUnknown(reader.name.clone()))?;
        Ok(entry.card.as_ref().map(|(id, _)| *id))
    }

    fn read_token_directory(&self, reader: &ReaderDescriptor) -> MediumResult<TokenDirectory> {
        self.with_card(reader, |card| {
            if card.unreadable {
                return Err(MediumError::Unreadable(reader.name.clone()));
            }
            Ok(card.directory.clone())
        })
    }

    fn check_credential(
        &self,
        reader: &ReaderDescriptor,
        role: UserType,
        credential: &[u8],
    ) -> MediumResult<bool> {
        self.with_card(reader, |card| {
            let expected = match role {
                UserType::User => &card.user_hash,
                UserType::SecurityOfficer => &card.so_hash,
            };
            Ok(hash_credential(credential) == *expected)
        })
    }

    fn store_credential(
        &self,
        reader: &ReaderDescriptor,
        role: UserType,
        credential: &[u8],
    ) -> MediumResult<()> {
        let mut readers = self.readers.write();
        let (_, card) = readers
            .get_mut(&reader.name)
            .ok_or_else(|| MediumError::ReaderUnknown(reader.name.clone()))?
            .card
            .as_mut()
            .ok_or_else(|| MediumError::CardAbsent(reader.name.clone()))?;
        let hash = hash_credential(credential);
        match role {
            UserType::User => card.user_hash = hash,
            UserType::SecurityOfficer => card.so_hash = hash,
        }
        Ok(())
    }
}

/// Convenience for building a private data object on a virtual card.
pub fn private_data_object(label: &str, value: &[u8]) -> AttributeSet {
    AttributeSet::new()
        .with(ids::CLASS, AttributeValue::Uint(class::DATA))
        .with(ids::TOKEN, AttributeValue::Bool(true))
        .with(ids::PRIVATE, AttributeValue::Bool(true))
        .with(ids::LABEL, AttributeValue::Bytes(label.as_bytes().to_vec()))
        .with(ids::VALUE, AttributeValue::Bytes(value.to_vec()))
}
