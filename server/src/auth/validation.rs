//! Shape checks applied to authentication input before any table is touched.

use shared::AuthMethod;
use thiserror::Error;

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_FINGERPRINT_LEN: usize = 128;
pub const MAX_ENDPOINT_LEN: usize = 64;
pub const MIN_PLATFORM_TOKEN_LEN: usize = 16;
pub const MAX_CUSTOM_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("player name must be 1 to {max} characters")]
    NameLength { max: usize },

    #[error("player name contains invalid characters: {chars}")]
    NameCharacters { chars: String },

    #[error("hardware fingerprint must be 1 to {max} characters")]
    Fingerprint { max: usize },

    #[error("network endpoint must be 1 to {max} characters")]
    Endpoint { max: usize },

    #[error("{method} token has an invalid shape")]
    Token { method: &'static str },
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-'
}

fn is_custom_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '_' | '-')
}

pub fn validate_name(name: &str) -> Result<(), ShapeError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ShapeError::NameLength { max: MAX_NAME_LEN });
    }
    let bad: String = name.chars().filter(|c| !is_name_char(*c)).collect();
    if !bad.is_empty() {
        return Err(ShapeError::NameCharacters { chars: bad });
    }
    Ok(())
}

pub fn validate_fingerprint(fingerprint: &str) -> Result<(), ShapeError> {
    if fingerprint.is_empty() || fingerprint.len() > MAX_FINGERPRINT_LEN {
        return Err(ShapeError::Fingerprint {
            max: MAX_FINGERPRINT_LEN,
        });
    }
    Ok(())
}

pub fn validate_endpoint(endpoint: &str) -> Result<(), ShapeError> {
    if endpoint.is_empty() || endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(ShapeError::Endpoint {
            max: MAX_ENDPOINT_LEN,
        });
    }
    Ok(())
}

/// Token rules depend on the platform that issued it.
///
/// Anonymous accepts any non-empty token. Platform tickets (Steam, GOG, Epic)
/// must be at least 16 characters. Custom tokens are 16 to 128 characters of
/// base64/URL-safe alphabet.
pub fn validate_token(method: AuthMethod, token: &str) -> Result<(), ShapeError> {
    let ok = match method {
        AuthMethod::Anonymous => !token.is_empty(),
        AuthMethod::Steam | AuthMethod::Gog | AuthMethod::Epic => {
            token.len() >= MIN_PLATFORM_TOKEN_LEN
        }
        AuthMethod::Custom => {
            (MIN_PLATFORM_TOKEN_LEN..=MAX_CUSTOM_TOKEN_LEN).contains(&token.len())
                && token.chars().all(is_custom_token_char)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(ShapeError::Token {
            method: method.name(),
        })
    }
}
