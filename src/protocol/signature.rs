//! Message signatures: HMAC over the key-value form of the signed fields.

use super::{message::key_value_form, Message, ProtocolError};
use crate::store::{AssocType, Association};
use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

fn mac(assoc_type: AssocType, key: &[u8], payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    match assoc_type {
        AssocType::HmacSha1 => Hmac::<Sha1>::new_from_slice(key)
            .map(|mut mac| {
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            })
            .unwrap_or_default(),
        AssocType::HmacSha256 => Hmac::<Sha256>::new_from_slice(key)
            .map(|mut mac| {
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            })
            .unwrap_or_default(),
    }
}

fn signed_payload(message: &Message, fields: &[&str]) -> Result<String, ProtocolError> {
    let mut pairs = Vec::with_capacity(fields.len());
    for field in fields {
        let value = message
            .get(field)
            .ok_or_else(|| ProtocolError::MissingField((*field).to_string()))?;
        pairs.push((*field, value));
    }
    Ok(key_value_form(pairs))
}

/// Compute the base64 signature over `fields`, in order.
///
/// # Errors
/// [`ProtocolError::MissingField`] when a listed field is absent.
pub fn sign(
    association: &Association,
    message: &Message,
    fields: &[&str],
) -> Result<String, ProtocolError> {
    let payload = signed_payload(message, fields)?;
    let digest = mac(
        association.assoc_type,
        association.secret_bytes(),
        payload.as_bytes(),
    );
    Ok(Base64::encode_string(&digest))
}

/// Check `openid.sig` against the fields named in `openid.signed`.
///
/// # Errors
/// [`ProtocolError::MissingField`] when `sig`, `signed` or a signed field is
/// absent.
pub fn verify(association: &Association, message: &Message) -> Result<bool, ProtocolError> {
    let provided = message
        .get("sig")
        .ok_or_else(|| ProtocolError::MissingField("sig".to_string()))?;
    let fields = message.signed_fields();
    if fields.is_empty() {
        return Err(ProtocolError::MissingField("signed".to_string()));
    }

    let Ok(provided) = Base64::decode_vec(provided.trim()) else {
        return Ok(false);
    };
    let payload = signed_payload(message, &fields)?;
    let expected = mac(
        association.assoc_type,
        association.secret_bytes(),
        payload.as_bytes(),
    );

    Ok(expected.ct_eq(&provided).into())
}
