use std::collections::BTreeMap;

use crate::error::{P11Error, P11Result};

/// Identifier for a PKCS#11 attribute (mirrors CK_ATTRIBUTE_TYPE numeric values).
pub type AttributeId = u64;

/// Attribute identifiers understood by the core.
pub mod ids {
    use super::AttributeId;

    pub const CLASS: AttributeId = 0x0000;
    pub const TOKEN: AttributeId = 0x0001;
    pub const PRIVATE: AttributeId = 0x0002;
    pub const LABEL: AttributeId = 0x0003;
    pub const APPLICATION: AttributeId = 0x0010;
    pub const VALUE: AttributeId = 0x0011;
    pub const OBJECT_ID: AttributeId = 0x0012;
    pub const CERTIFICATE_TYPE: AttributeId = 0x0080;
    pub const ISSUER: AttributeId = 0x0081;
    pub const SERIAL_NUMBER: AttributeId = 0x0082;
    pub const TRUSTED: AttributeId = 0x0086;
    pub const CERTIFICATE_CATEGORY: AttributeId = 0x0087;
    pub const KEY_TYPE: AttributeId = 0x0100;
    pub const SUBJECT: AttributeId = 0x0101;
    pub const ID: AttributeId = 0x0102;
    pub const SENSITIVE: AttributeId = 0x0103;
    pub const ENCRYPT: AttributeId = 0x0104;
    pub const DECRYPT: AttributeId = 0x0105;
    pub const WRAP: AttributeId = 0x0106;
    pub const UNWRAP: AttributeId = 0x0107;
    pub const SIGN: AttributeId = 0x0108;
    pub const SIGN_RECOVER: AttributeId = 0x0109;
    pub const VERIFY: AttributeId = 0x010A;
    pub const VERIFY_RECOVER: AttributeId = 0x010B;
    pub const DERIVE: AttributeId = 0x010C;
    pub const MODULUS: AttributeId = 0x0120;
    pub const MODULUS_BITS: AttributeId = 0x0121;
    pub const PUBLIC_EXPONENT: AttributeId = 0x0122;
    pub const PRIVATE_EXPONENT: AttributeId = 0x0123;
    pub const PRIME_1: AttributeId = 0x0124;
    pub const PRIME_2: AttributeId = 0x0125;
    pub const EXPONENT_1: AttributeId = 0x0126;
    pub const EXPONENT_2: AttributeId = 0x0127;
    pub const COEFFICIENT: AttributeId = 0x0128;
    pub const VALUE_LEN: AttributeId = 0x0161;
    pub const EXTRACTABLE: AttributeId = 0x0162;
    pub const LOCAL: AttributeId = 0x0163;
    pub const NEVER_EXTRACTABLE: AttributeId = 0x0164;
    pub const ALWAYS_SENSITIVE: AttributeId = 0x0165;
    pub const MODIFIABLE: AttributeId = 0x0170;
    pub const COPYABLE: AttributeId = 0x0171;
    pub const DESTROYABLE: AttributeId = 0x0172;
    pub const EC_PARAMS: AttributeId = 0x0180;
    pub const EC_POINT: AttributeId = 0x0181;
    /// Start of the vendor range; every attribute at or above it is
    /// reserved to the security officer.
    pub const VENDOR_DEFINED: AttributeId = 0x8000_0000;
}

/// Object classes (CKO_*).
pub mod class {
    pub const DATA: u64 = 0x0000;
    pub const CERTIFICATE: u64 = 0x0001;
    pub const PUBLIC_KEY: u64 = 0x0002;
    pub const PRIVATE_KEY: u64 = 0x0003;
    pub const SECRET_KEY: u64 = 0x0004;
}

/// Key types (CKK_*).
pub mod key_type {
    pub const RSA: u64 = 0x0000;
    pub const EC: u64 = 0x0003;
    pub const AES: u64 = 0x001F;
}

/// Wire representation of an attribute value at the C boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Bool,
    Ulong,
    Bytes,
}

/// Returns how values of `id` are encoded in a CK_ATTRIBUTE.
pub fn kind_of(id: AttributeId) -> AttributeKind {
    match id {
        ids::TOKEN
        | ids::PRIVATE
        | ids::TRUSTED
        | ids::SENSITIVE
        | ids::ENCRYPT
        | ids::DECRYPT
        | ids::WRAP
        | ids::UNWRAP
        | ids::SIGN
        | ids::SIGN_RECOVER
        | ids::VERIFY
        | ids::VERIFY_RECOVER
        | ids::DERIVE
        | ids::EXTRACTABLE
        | ids::LOCAL
        | ids::NEVER_EXTRACTABLE
        | ids::ALWAYS_SENSITIVE
        | ids::MODIFIABLE
        | ids::COPYABLE
        | ids::DESTROYABLE => AttributeKind::Bool,
        ids::CLASS
        | ids::CERTIFICATE_TYPE
        | ids::CERTIFICATE_CATEGORY
        | ids::KEY_TYPE
        | ids::MODULUS_BITS
        | ids::VALUE_LEN => AttributeKind::Ulong,
        _ => AttributeKind::Bytes,
    }
}

/// Attributes only the security officer may read, match or modify.
pub fn is_administrative(id: AttributeId) -> bool {
    id >= ids::VENDOR_DEFINED
}

/// Attributes that can never change once the object exists.
pub fn is_immutable(id: AttributeId) -> bool {
    matches!(id, ids::CLASS | ids::TOKEN | ids::PRIVATE)
}

/// Secret components withheld from objects marked sensitive or non-extractable.
pub fn is_secret_component(id: AttributeId) -> bool {
    matches!(
        id,
        ids::VALUE
            | ids::PRIVATE_EXPONENT
            | ids::PRIME_1
            | ids::PRIME_2
            | ids::EXPONENT_1
            | ids::EXPONENT_2
            | ids::COEFFICIENT
    )
}

/// Supported attribute value representations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Bool(bool),
    Uint(u64),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            AttributeValue::Uint(value) => Some(*value),
            _ => None,
        }
    }
}

/// Template used when searching for objects via attribute matching.
#[derive(Clone, Debug, Default)]
pub struct AttributeTemplate {
    entries: Vec<(AttributeId, AttributeValue)>,
}

impl AttributeTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: AttributeId, value: AttributeValue) -> Self {
        self.push(id, value);
        self
    }

    pub fn push(&mut self, id: AttributeId, value: AttributeValue) {
        self.entries.push((id, value));
    }

    pub fn entries(&self) -> &[(AttributeId, AttributeValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(AttributeId, AttributeValue)> for AttributeTemplate {
    fn from_iter<I: IntoIterator<Item = (AttributeId, AttributeValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Attribute set of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeSet {
    entries: BTreeMap<AttributeId, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: AttributeId, value: AttributeValue) -> Self {
        self.insert(id, value);
        self
    }

    pub fn insert(&mut self, id: AttributeId, value: AttributeValue) -> Option<AttributeValue> {
        self.entries.insert(id, value)
    }

    pub fn get(&self, id: AttributeId) -> Option<&AttributeValue> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: AttributeId) -> Option<AttributeValue> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeId, &AttributeValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flag(&self, id: AttributeId) -> Option<bool> {
        self.get(id).and_then(AttributeValue::as_bool)
    }

    pub fn class(&self) -> Option<u64> {
        self.get(ids::CLASS).and_then(AttributeValue::as_uint)
    }

    /// Ensure all required attribute identifiers are present.
    pub fn validate_required(&self, required: &[AttributeId]) -> P11Result<()> {
        for id in required {
            if !self.entries.contains_key(id) {
                return Err(P11Error::TemplateIncomplete(*id));
            }
        }
        Ok(())
    }

    /// Explicit `CKA_PRIVATE`, or true for key material classes when unset.
    pub fn is_private(&self) -> bool {
        self.flag(ids::PRIVATE).unwrap_or_else(|| {
            matches!(self.class(), Some(class::PRIVATE_KEY | class::SECRET_KEY))
        })
    }

    /// Sensitive objects withhold their secret components.
    pub fn is_sensitive(&self) -> bool {
        self.flag(ids::SENSITIVE) == Some(true) || self.flag(ids::EXTRACTABLE) == Some(false)
    }

    /// Returns true when all entries in the template match the set exactly.
    pub fn matches_template(&self, template: &AttributeTemplate) -> bool {
        template
            .entries()
            .iter()
            .all(|(id, value)| self.get(*id).is_some_and(|candidate| candidate == value))
    }
}

impl FromIterator<(AttributeId, AttributeValue)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (AttributeId, AttributeValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
