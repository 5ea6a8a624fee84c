//! Validators for identifying fields of batch records
//!
//! Batch input reaches the engine pre-parsed but the identifying fields
//! still must not carry characters that change the meaning of a C-FIND
//! identifier.

/// DICOM multi-value separator, not allowed in single-valued fields
pub fn no_backslashes(field: &str, value: &str) -> Result<(), String> {
    if value.contains('\\') {
        return Err(format!("{} contains a backslash character", field));
    }
    Ok(())
}

pub fn no_control_chars(field: &str, value: &str) -> Result<(), String> {
    if value.chars().any(|c| c.is_control()) {
        return Err(format!("{} contains control characters", field));
    }
    Ok(())
}

/// Wildcards are disallowed for all identifying fields in batch contexts
pub fn no_wildcards(field: &str, value: &str) -> Result<(), String> {
    if value.contains('*') || value.contains('?') {
        return Err(format!("{} contains wildcard characters", field));
    }
    Ok(())
}

pub fn valid_uid(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 64 {
        return Err(format!("{} is not a valid UID (wrong length)", field));
    }
    if !value.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(format!("{} is not a valid UID: {}", field, value));
    }
    Ok(())
}

/// Validate an identifying field against all three character classes
pub fn identifying_field(field: &str, value: &str) -> Result<(), String> {
    no_backslashes(field, value)?;
    no_control_chars(field, value)?;
    no_wildcards(field, value)
}
