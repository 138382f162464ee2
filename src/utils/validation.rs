pub struct InputValidator;

const MAX_IDENTIFIER_LEN: usize = 128;

impl InputValidator {
    /// Validate a scope or container identifier.
    ///
    /// Identifiers end up in filesystem paths and command arguments, so only
    /// `[A-Za-z0-9_.-]` is accepted, without a leading `-` or `.` and without `..`.
    pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
        if value.is_empty() {
            return Err(format!("{} cannot be empty", kind));
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(format!(
                "{} is too long ({} > {} characters)",
                kind,
                value.len(),
                MAX_IDENTIFIER_LEN
            ));
        }
        if value.starts_with('-') || value.starts_with('.') {
            return Err(format!("{} cannot start with '-' or '.'", kind));
        }
        if value.contains("..") {
            return Err(format!("{} cannot contain '..'", kind));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(format!("{} contains invalid character {:?}", kind, bad));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for id in ["test-scope", "scope_1", "a", "abc123def456", "desktop.v2"] {
            assert!(InputValidator::validate_identifier("scope_id", id).is_ok(), "{}", id);
        }
    }

    #[test]
    fn rejects_path_and_flag_injection() {
        for id in ["", "../etc", "a/b", "-rf", ".hidden", "a..b", "sp ace", "semi;colon"] {
            assert!(InputValidator::validate_identifier("scope_id", id).is_err(), "{}", id);
        }
        let long = "x".repeat(129);
        assert!(InputValidator::validate_identifier("scope_id", &long).is_err());
    }
}
