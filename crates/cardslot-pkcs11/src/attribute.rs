//! Conversion between `CK_ATTRIBUTE` arrays and core attribute values.
//!
//! Booleans travel as a single `CK_BBOOL` byte, numeric attributes as a
//! native `CK_ULONG`, everything else as raw bytes.

use std::{mem::size_of, ptr, slice};

use cardslot_core::{
    AttributeId, AttributeLookup, AttributeSet, AttributeTemplate, AttributeValue,
    attributes::{AttributeKind, kind_of},
};
use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_BBOOL, CK_FALSE, CK_RV, CK_TRUE, CK_ULONG,
    CK_UNAVAILABLE_INFORMATION, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_OK,
};

use crate::FrontendError;

/// Decode the raw value of attribute `id`.
pub fn decode_value(id: AttributeId, raw: &[u8]) -> Result<AttributeValue, FrontendError> {
    match kind_of(id) {
        AttributeKind::Bool => match raw {
            [byte] => Ok(AttributeValue::Bool(*byte != CK_FALSE)),
            _ => Err(FrontendError::AttributeValueInvalid(id)),
        },
        AttributeKind::Ulong => {
            let bytes: [u8; size_of::<CK_ULONG>()] = raw
                .try_into()
                .map_err(|_| FrontendError::AttributeValueInvalid(id))?;
            Ok(AttributeValue::Uint(CK_ULONG::from_ne_bytes(bytes) as u64))
        }
        AttributeKind::Bytes => Ok(AttributeValue::Bytes(raw.to_vec())),
    }
}

/// Encode a value the way `C_GetAttributeValue` hands it back.
pub fn encode_value(value: &AttributeValue) -> Vec<u8> {
    match value {
        AttributeValue::Bool(flag) => {
            let byte: CK_BBOOL = if *flag { CK_TRUE } else { CK_FALSE };
            vec![byte]
        }
        AttributeValue::Uint(number) => (*number as CK_ULONG).to_ne_bytes().to_vec(),
        AttributeValue::Bytes(bytes) => bytes.clone(),
    }
}

/// View `count` attributes starting at `template`.
///
/// # Safety
/// `template` must be null with `count == 0`, or point to `count`
/// initialized `CK_ATTRIBUTE`s valid for the returned lifetime.
pub unsafe fn attributes<'a>(
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> Result<&'a mut [CK_ATTRIBUTE], FrontendError> {
    if count == 0 {
        return Ok(&mut []);
    }
    if template.is_null() {
        return Err(FrontendError::ArgumentsBad);
    }
    Ok(unsafe { slice::from_raw_parts_mut(template, count as usize) })
}

/// Decode every entry of a caller template.
///
/// # Safety
/// Each `pValue` must be null with a zero length or point to `ulValueLen`
/// readable bytes.
pub unsafe fn read_template(
    raw: &[CK_ATTRIBUTE],
) -> Result<Vec<(AttributeId, AttributeValue)>, FrontendError> {
    raw.iter()
        .map(|attribute| {
            let id = attribute.type_ as AttributeId;
            let len = attribute.ulValueLen as usize;
            let bytes: &[u8] = if len == 0 {
                &[]
            } else if attribute.pValue.is_null() {
                return Err(FrontendError::ArgumentsBad);
            } else {
                unsafe { slice::from_raw_parts(attribute.pValue as *const u8, len) }
            };
            Ok((id, decode_value(id, bytes)?))
        })
        .collect()
}

/// # Safety
/// See [`read_template`].
pub unsafe fn template_from(raw: &[CK_ATTRIBUTE]) -> Result<AttributeTemplate, FrontendError> {
    Ok(unsafe { read_template(raw) }?.into_iter().collect())
}

/// # Safety
/// See [`read_template`].
pub unsafe fn attribute_set_from(raw: &[CK_ATTRIBUTE]) -> Result<AttributeSet, FrontendError> {
    Ok(unsafe { read_template(raw) }?.into_iter().collect())
}

/// Fill a `C_GetAttributeValue` template from the core's lookups. Every
/// entry is processed; the returned code reports the last problem seen.
///
/// # Safety
/// Each non-null `pValue` must be writable for `ulValueLen` bytes.
pub unsafe fn write_lookups(raw: &mut [CK_ATTRIBUTE], lookups: &[AttributeLookup]) -> CK_RV {
    let mut rv = CKR_OK;
    for (attribute, lookup) in raw.iter_mut().zip(lookups) {
        let value = match lookup {
            AttributeLookup::Value(value) => encode_value(value),
            AttributeLookup::Sensitive => {
                attribute.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                rv = CKR_ATTRIBUTE_SENSITIVE;
                continue;
            }
            AttributeLookup::Invalid => {
                attribute.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                rv = CKR_ATTRIBUTE_TYPE_INVALID;
                continue;
            }
        };
        if attribute.pValue.is_null() {
            attribute.ulValueLen = value.len() as CK_ULONG;
        } else if (attribute.ulValueLen as usize) < value.len() {
            attribute.ulValueLen = CK_UNAVAILABLE_INFORMATION;
            rv = CKR_BUFFER_TOO_SMALL;
        } else {
            unsafe {
                ptr::copy_nonoverlapping(value.as_ptr(), attribute.pValue as *mut u8, value.len());
            }
            attribute.ulValueLen = value.len() as CK_ULONG;
        }
    }
    rv
}
