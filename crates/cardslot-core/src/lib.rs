//! CardSlot core: slot, token, session and object management for a PKCS#11
//! provider fronting removable secure hardware. The card driver sits behind
//! the [`Medium`] trait; the C entry points live in `cardslot-pkcs11` and
//! interact exclusively with [`Context`].

pub mod attributes;
pub mod config;
pub mod context;
pub mod error;
pub mod medium;
pub mod object;
pub mod pkcs15;
pub mod session;
pub mod slot;
pub mod tlv;
pub mod token;

pub use attributes::{AttributeId, AttributeSet, AttributeTemplate, AttributeValue};
pub use config::{ConfigError, ModuleConfig, TokenPolicy};
pub use context::{Context, LibraryInfo};
pub use error::{CredentialFailure, ErrorKind, P11Error, P11Result, Resource};
pub use medium::{Medium, MediumError, ReaderDescriptor, SoftCard, SoftMedium, TokenDirectory};
pub use object::{AttributeLookup, ObjectHandle, ObjectSearch};
pub use session::{SessionHandle, SessionInfo, SessionMode, SessionPool, SessionState};
pub use slot::{Slot, SlotEvent, SlotId, SlotInfo, SlotPool};
pub use token::{CredentialStatus, LoginState, Token, TokenId, TokenInfo, UserType};
