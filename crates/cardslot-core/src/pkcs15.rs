//! Decoder for PKCS#15 private key descriptions (PrKD).
//!
//! Cards list their private keys as PrKD entries in the object directory.
//! Only the fields the management layer needs are extracted: label, key
//! identifier, usage flags and key size.

use thiserror::Error;

use crate::{
    attributes::{AttributeSet, AttributeValue, class, ids, key_type},
    tlv::{
        TAG_BIT_STRING, TAG_CONTEXT_0, TAG_CONTEXT_1, TAG_INTEGER, TAG_OCTET_STRING,
        TAG_SEQUENCE, TAG_UTF8_STRING, TlvError, TlvReader, decode_bit_flags, decode_u32,
    },
};

/// Key size assumed when the description omits it.
pub const DEFAULT_KEY_SIZE: u32 = 2048;

/// PKCS#15 KeyUsageFlags bit positions.
pub mod usage {
    pub const ENCRYPT: u32 = 1 << 0;
    pub const DECRYPT: u32 = 1 << 1;
    pub const SIGN: u32 = 1 << 2;
    pub const SIGN_RECOVER: u32 = 1 << 3;
    pub const WRAP: u32 = 1 << 4;
    pub const UNWRAP: u32 = 1 << 5;
    pub const VERIFY: u32 = 1 << 6;
    pub const VERIFY_RECOVER: u32 = 1 << 7;
    pub const DERIVE: u32 = 1 << 8;
    pub const NON_REPUDIATION: u32 = 1 << 9;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Pkcs15Error {
    #[error(transparent)]
    Tlv(#[from] TlvError),
    #[error("unsupported private key choice {0:#x}")]
    UnsupportedKeyType(u32),
    #[error("empty key identifier")]
    EmptyIdentifier,
    #[error("invalid usage flags")]
    InvalidUsage,
    #[error("missing key attributes")]
    MissingKeyAttributes,
    #[error("label is not valid UTF-8")]
    InvalidLabel,
    #[error("invalid key size")]
    InvalidKeySize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateKeyType {
    Rsa,
    Ec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyDescription {
    pub key_type: PrivateKeyType,
    pub label: Option<String>,
    pub id: Vec<u8>,
    pub usage: u32,
    pub key_size: u32,
}

impl PrivateKeyDescription {
    fn empty(key_type: PrivateKeyType) -> Self {
        Self {
            key_type,
            label: None,
            id: Vec::new(),
            usage: 0,
            key_size: DEFAULT_KEY_SIZE,
        }
    }

    /// Attributes of the private key object materialized from this entry.
    pub fn to_attributes(&self) -> AttributeSet {
        let has = |bits: u32| AttributeValue::Bool(self.usage & bits != 0);
        let mut attrs = AttributeSet::new()
            .with(ids::CLASS, AttributeValue::Uint(class::PRIVATE_KEY))
            .with(
                ids::KEY_TYPE,
                AttributeValue::Uint(match self.key_type {
                    PrivateKeyType::Rsa => key_type::RSA,
                    PrivateKeyType::Ec => key_type::EC,
                }),
            )
            .with(ids::ID, AttributeValue::Bytes(self.id.clone()))
            .with(ids::TOKEN, AttributeValue::Bool(true))
            .with(ids::PRIVATE, AttributeValue::Bool(true))
            .with(ids::SENSITIVE, AttributeValue::Bool(true))
            .with(ids::EXTRACTABLE, AttributeValue::Bool(false))
            .with(
                ids::SIGN,
                has(usage::SIGN | usage::SIGN_RECOVER | usage::NON_REPUDIATION),
            )
            .with(ids::DECRYPT, has(usage::DECRYPT))
            .with(ids::UNWRAP, has(usage::UNWRAP))
            .with(ids::DERIVE, has(usage::DERIVE));
        if let Some(label) = &self.label {
            attrs.insert(ids::LABEL, AttributeValue::Bytes(label.as_bytes().to_vec()));
        }
        if self.key_type == PrivateKeyType::Rsa {
            attrs.insert(ids::MODULUS_BITS, AttributeValue::Uint(self.key_size as u64));
        }
        attrs
    }
}

/// Decode one DER encoded PrKD entry.
pub fn decode_private_key_description(der: &[u8]) -> Result<PrivateKeyDescription, Pkcs15Error> {
    let mut outer = TlvReader::new(der);
    let choice = outer.read()?;
    outer.finish()?;

    let key_type = match choice.tag {
        TAG_SEQUENCE => PrivateKeyType::Rsa,
        TAG_CONTEXT_0 => PrivateKeyType::Ec,
        other => return Err(Pkcs15Error::UnsupportedKeyType(other)),
    };
    let mut description = PrivateKeyDescription::empty(key_type);
    let mut fields = choice.children();

    if fields.is_empty() {
        return Ok(description);
    }
    decode_common_object_attributes(&mut fields, &mut description)?;

    if fields.is_empty() {
        return Ok(description);
    }
    decode_common_key_attributes(&mut fields, &mut description)?;

    if fields.is_empty() {
        return Ok(description);
    }
    // Subclass attributes carry nothing the token layer uses.
    fields.read_if(TAG_CONTEXT_0)?;
    if fields.is_empty() {
        return Ok(description);
    }

    let type_attributes = fields.expect(TAG_CONTEXT_1)?;
    if type_attributes.value.is_empty() {
        return Err(Pkcs15Error::MissingKeyAttributes);
    }
    let key_attributes = type_attributes.children().expect(TAG_SEQUENCE)?;
    if key_attributes.value.is_empty() {
        return Err(Pkcs15Error::MissingKeyAttributes);
    }
    decode_key_attributes(key_attributes.children(), &mut description)?;
    Ok(description)
}

fn decode_common_object_attributes(
    fields: &mut TlvReader<'_>,
    description: &mut PrivateKeyDescription,
) -> Result<(), Pkcs15Error> {
    let common = fields.expect(TAG_SEQUENCE)?;
    if let Some(label) = common.children().read_if(TAG_UTF8_STRING)? {
        let label =
            std::str::from_utf8(label.value).map_err(|_| Pkcs15Error::InvalidLabel)?;
        description.label = Some(label.to_string());
    }
    Ok(())
}

fn decode_common_key_attributes(
    fields: &mut TlvReader<'_>,
    description: &mut PrivateKeyDescription,
) -> Result<(), Pkcs15Error> {
    let common = fields.expect(TAG_SEQUENCE)?;
    let mut reader = common.children();

    let id = reader.expect(TAG_OCTET_STRING)?;
    if id.value.is_empty() {
        return Err(Pkcs15Error::EmptyIdentifier);
    }
    description.id = id.value.to_vec();

    if reader.is_empty() {
        return Ok(());
    }
    let usage = reader.expect(TAG_BIT_STRING)?;
    if usage.value.len() <= 1 {
        return Err(Pkcs15Error::InvalidUsage);
    }
    description.usage = decode_bit_flags(usage.value).ok_or(Pkcs15Error::InvalidUsage)?;
    Ok(())
}

fn decode_key_attributes(
    mut reader: TlvReader<'_>,
    description: &mut PrivateKeyDescription,
) -> Result<(), Pkcs15Error> {
    // Path to the key value on the card; not needed here.
    let path = reader.expect(TAG_SEQUENCE)?;
    if path.value.is_empty() {
        return Err(Pkcs15Error::MissingKeyAttributes);
    }
    if let Some(size) = reader.read_if(TAG_INTEGER)? {
        description.key_size = decode_u32(size.value).ok_or(Pkcs15Error::InvalidKeySize)?;
    }
    Ok(())
}
