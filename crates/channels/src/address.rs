use thiserror::Error;

/// Suffix for individual chats.
pub const DEFAULT_ADDRESS_SUFFIX: &str = "@c.us";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("recipient address is empty")]
    Empty,

    #[error("recipient '{0}' contains no digits")]
    NoDigits(String),
}

/// Normalize a recipient into the driver's address format.
///
/// Addresses that already carry a domain (`...@c.us`, `...@g.us`) pass through
/// trimmed. Anything else is treated as a phone number: every non-digit is
/// stripped and `suffix` is appended.
pub fn normalize_address(raw: &str, suffix: &str) -> Result<String, AddressError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AddressError::Empty);
    }
    if raw.contains('@') {
        return Ok(raw.to_string());
    }

    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(AddressError::NoDigits(raw.to_string()));
    }
    Ok(format!("{digits}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting_and_appends_suffix() {
        assert_eq!(
            normalize_address("+55 (11) 99999-9999", DEFAULT_ADDRESS_SUFFIX).unwrap(),
            "5511999999999@c.us"
        );
    }

    #[test]
    fn full_addresses_pass_through() {
        assert_eq!(
            normalize_address(" 120363@g.us ", DEFAULT_ADDRESS_SUFFIX).unwrap(),
            "120363@g.us"
        );
    }

    #[test]
    fn rejects_empty_and_digitless() {
        assert_eq!(normalize_address("  ", "@c.us"), Err(AddressError::Empty));
        assert_eq!(
            normalize_address("abc", "@c.us"),
            Err(AddressError::NoDigits("abc".into()))
        );
    }

    #[test]
    fn honours_custom_suffix() {
        assert_eq!(
            normalize_address("5511", "@s.whatsapp.net").unwrap(),
            "5511@s.whatsapp.net"
        );
    }
}
