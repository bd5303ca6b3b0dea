use crate::error::InitiationError;

/// Normalize a subscriber phone number to international MSISDN form.
///
/// Spaces, dashes and a leading `+` are dropped; a leading trunk `0` is replaced
/// with `country_code`. Numbers already carrying the country code pass through.
pub fn normalize_phone(raw: Option<&str>, country_code: &str) -> Result<String, InitiationError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(InitiationError::MissingContact);
    }

    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InitiationError::InvalidContact(raw.to_string()));
    }

    let normalized = match digits.strip_prefix('0') {
        Some(rest) => format!("{}{}", country_code, rest),
        None => digits.to_string(),
    };

    // E.164 caps numbers at 15 digits.
    if !(10..=15).contains(&normalized.len()) {
        return Err(InitiationError::InvalidContact(raw.to_string()));
    }

    Ok(normalized)
}
