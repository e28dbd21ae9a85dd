//! Report ID generation and validation.
//!
//! Every result carries a report ID - a short string identifying the run in
//! file names and report headers. IDs are restricted to a file-system and
//! URL safe character set.

use crate::error::{Error, Result};
use crate::human;

/// Characters allowed in a report ID besides ASCII alphanumerics.
const SPECIAL_CHARS: &str = "-.,_:";

/// Maximum report ID length.
const MAX_LEN: usize = 64;

/// Validate a user-supplied report ID.
pub fn validate(reportid: &str) -> Result<()> {
    if reportid.is_empty() {
        return Err(Error::producer("report ID must not be empty"));
    }
    if reportid.len() > MAX_LEN {
        return Err(Error::producer(format!(
            "too long report ID ({} characters), the maximum is {MAX_LEN}",
            reportid.len()
        )));
    }
    for c in reportid.chars() {
        if !c.is_ascii_alphanumeric() && !SPECIAL_CHARS.contains(c) {
            return Err(Error::producer(format!(
                "bad character '{c}' in report ID '{reportid}', use ASCII letters, digits and \
                 '{SPECIAL_CHARS}'"
            )));
        }
    }
    Ok(())
}

/// Generate the default date-based report ID, e.g. `20260801-143055`.
pub fn generate() -> String {
    let (y, mo, d, h, mi, s) = human::civil_now();
    format!("{y:04}{mo:02}{d:02}-{h:02}{mi:02}{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("20260801-143055").is_ok());
        assert!(validate("my_laptop.C6-test,2").is_ok());
        assert!(validate("").is_err());
        assert!(validate("has space").is_err());
        assert!(validate("sl/ash").is_err());
        assert!(validate(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_generated_id_is_valid() {
        let id = generate();
        assert!(validate(&id).is_ok());
        assert_eq!(id.len(), "20260801-143055".len());
    }
}
