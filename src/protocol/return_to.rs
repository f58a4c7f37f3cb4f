use super::ProtocolError;
use url::Url;

/// Check that the asserted `return_to` points at the URL the response actually
/// arrived on, and that every query parameter it carries came back unchanged.
///
/// # Errors
/// [`ProtocolError::ReturnTo`] describing the first difference.
pub fn verify_return_to(
    return_to: &str,
    request_url: &str,
    params: &[(String, String)],
) -> Result<(), ProtocolError> {
    let expected = Url::parse(return_to)
        .map_err(|_| ProtocolError::ReturnTo(format!("malformed return_to {return_to}")))?;
    let actual = Url::parse(request_url)
        .map_err(|_| ProtocolError::ReturnTo(format!("malformed request URL {request_url}")))?;

    if expected.scheme() != actual.scheme()
        || expected.host_str() != actual.host_str()
        || expected.port_or_known_default() != actual.port_or_known_default()
        || expected.path() != actual.path()
    {
        return Err(ProtocolError::ReturnTo(format!(
            "{return_to} does not match {request_url}"
        )));
    }

    for (key, value) in expected.query_pairs() {
        let echoed = params
            .iter()
            .any(|(k, v)| k.as_str() == key.as_ref() && v.as_str() == value.as_ref());
        if !echoed {
            return Err(ProtocolError::ReturnTo(format!(
                "parameter {key} is missing or altered"
            )));
        }
    }

    Ok(())
}
