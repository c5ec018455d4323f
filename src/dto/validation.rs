//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::dao::models::SessionCode;

/// Longest accepted display name, counted in characters after trimming.
pub const MAX_NAME_CHARS: usize = 32;

/// Validates that a display name has 1 to [`MAX_NAME_CHARS`] characters once trimmed.
///
/// # Examples
///
/// ```ignore
/// validate_display_name("  Ada ")  // Ok
/// validate_display_name("   ")     // Err - blank
/// ```
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("name_blank");
        err.message = Some("Name must not be blank".into());
        return Err(err);
    }

    let chars = trimmed.chars().count();
    if chars > MAX_NAME_CHARS {
        let mut err = ValidationError::new("name_length");
        err.message = Some(
            format!("Name must be at most {MAX_NAME_CHARS} characters (got {chars})").into(),
        );
        return Err(err);
    }

    Ok(())
}

/// Validates that a session code normalises to 6 letters or digits.
pub fn validate_session_code(code: &str) -> Result<(), ValidationError> {
    SessionCode::parse(code).map(|_| ()).map_err(|invalid| {
        let mut err = ValidationError::new("session_code_format");
        err.message = Some(invalid.to_string().into());
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_display_name_valid() {
        assert!(validate_display_name("Ada").is_ok());
        assert!(validate_display_name("  Grace Hopper  ").is_ok());
        assert!(validate_display_name(&"x".repeat(MAX_NAME_CHARS)).is_ok());
    }

    #[test]
    fn test_validate_display_name_invalid() {
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_NAME_CHARS + 1)).is_err());
    }

    #[test]
    fn test_validate_session_code() {
        assert!(validate_session_code("k7q2zp").is_ok());
        assert!(validate_session_code("K7Q2Z").is_err()); // too short
        assert!(validate_session_code("K7Q2Z!").is_err()); // symbol
    }
}
