// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport collaborator boundary and the message payloads handed to it.
//!
//! Transports carry no retry guarantee: an error propagates to the task that issued the send.
//! Address and number validation lives here so it can run during the validation stage, long
//! before any task touches a transport.

use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::render::RenderFormat;

/// Splits a recipient field into individual addresses or numbers.
static RECIPIENT_SPLIT: Lazy<Regex> = Lazy::new(|| {
    // Unwrap is safe, pattern is static
    Regex::new(r"[;,]\s*").unwrap()
});

/// One file carried by an outgoing email, either inline (referenced by cid) or appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// The content reference string this attachment originated from. `None` for synthesized
    /// attachments such as merged PDFs or the trigger data file itself.
    pub reference: Option<String>,

    /// Custom output filename, when the reference carried one.
    pub filename: Option<String>,

    /// Path of the local artifact.
    pub path: PathBuf,

    /// Artifact format.
    pub format: RenderFormat,

    /// Whether this attachment takes part in PDF merging.
    pub merge_pdf: bool,
}

impl Attachment {
    /// Name the attachment should be delivered under: the custom filename when present, the
    /// artifact's own basename otherwise.
    pub fn delivery_name(&self) -> String {
        match &self.filename {
            Some(name) => name.clone(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// One fully assembled outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPayload {
    pub from: String,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: String,
    pub body: String,

    /// Attachments referenced from the body via `cid:`, in substitution order.
    pub inline_attachments: Vec<Attachment>,

    /// Attachments appended to the message, in collection order.
    pub appended_attachments: Vec<Attachment>,
}

/// One fully assembled outgoing SMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsPayload {
    pub from: String,

    /// Recipient number in E.164 form.
    pub to: String,

    pub body: String,
}

/// Sends one assembled email. No retry at this boundary.
#[async_trait::async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, payload: &EmailPayload) -> anyhow::Result<()>;
}

/// Sends one assembled SMS. No retry at this boundary.
#[async_trait::async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, payload: &SmsPayload) -> anyhow::Result<()>;
}

/// Splits a delimited recipient field into its non-empty entries.
pub fn split_recipients(field: &str) -> Vec<&str> {
    RECIPIENT_SPLIT
        .split(field.trim())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Checks one email address for syntactic validity and, when an allow-list regex is configured,
/// for administrator approval. Returns a description of the first problem found.
pub fn address_error(address: &str, allowed: Option<&Regex>) -> Option<String> {
    if address.is_empty() {
        return Some("Address is empty".into());
    }

    if let Some(allowed) = allowed {
        debug!("Testing address {} against regex {}", address, allowed);
        if !allowed.is_match(address) {
            return Some(format!(
                "Address must match regex pattern set by the administrator: {}",
                allowed
            ));
        }
    }

    if address.len() < 6 {
        return Some(format!("Address is too short: {}", address));
    }

    if !address.is_ascii() {
        return Some(format!(
            "Address must contain only ASCII characters: {}",
            address
        ));
    }

    if address.len() > 254 {
        return Some("Address exceeds max length (254 characters)".into());
    }

    let (local, domain) = match address.rsplit_once('@') {
        Some(parts) => parts,
        None => return Some("Address has too few parts".into()),
    };
    let host = match domain.rsplit_once('.') {
        Some((host, _top_level)) => host,
        None => return Some("Address has too few parts".into()),
    };

    if local.len() > 64 {
        return Some("Localpart of address exceeds max length (64 characters)".into());
    }

    let local_stripped: String = local
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '.' | '%' | '+'))
        .collect();
    let host_stripped: String = host
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '.'))
        .collect();

    if local_stripped.chars().all(|c| c.is_ascii_alphanumeric())
        && !local_stripped.is_empty()
        && host_stripped.chars().all(|c| c.is_ascii_alphanumeric())
        && !host_stripped.is_empty()
    {
        None
    } else {
        Some(format!("Address has funny characters: {}", address))
    }
}

/// Checks every address in a delimited field. `empty_ok` permits a fully empty field (CC/BCC).
/// Returns the first offending `(address, error)` pair.
pub fn addresses_error(
    field: &str,
    empty_ok: bool,
    allowed: Option<&Regex>,
) -> Option<(String, String)> {
    let addresses = split_recipients(field);

    if addresses.is_empty() {
        if empty_ok {
            return None;
        }
        return Some((field.to_string(), "Address is empty".into()));
    }

    for address in addresses {
        if let Some(error) = address_error(address, allowed) {
            let mut shown = address.to_string();
            if shown.len() > 64 {
                shown.truncate(64);
                shown.push_str("...");
            }
            return Some((shown, error));
        }
    }

    None
}

/// Converts one phone number to E.164 form, assuming `country_code` when the number carries no
/// leading `+`. Returns an error message when the number cannot possibly be valid.
pub fn number_to_e164(number: &str, country_code: &str) -> Result<String, String> {
    let cleaned: String = number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    let (digits, had_plus) = match cleaned.strip_prefix('+') {
        Some(rest) => (rest, true),
        None => (cleaned.as_str(), false),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("SMS number is not possibly valid: {}", number));
    }

    let e164 = if had_plus {
        format!("+{}", digits)
    } else {
        format!("+{}{}", country_code, digits)
    };

    // E.164 allows at most 15 digits after the plus
    let digit_count = e164.len() - 1;
    if !(7..=15).contains(&digit_count) {
        return Err(format!("SMS number is not possibly valid: {}", number));
    }

    Ok(e164)
}

/// Checks every number in a delimited field, testing the E.164 form against the administrator
/// allow-list when configured. Returns the first offending `(number, error)` pair.
pub fn numbers_error(
    field: &str,
    country_code: &str,
    allowed: Option<&Regex>,
) -> Option<(String, String)> {
    let numbers = split_recipients(field);

    if numbers.is_empty() {
        return Some((field.to_string(), "SMS number is empty".into()));
    }

    for number in numbers {
        match number_to_e164(number, country_code) {
            Ok(e164) => {
                if let Some(allowed) = allowed {
                    if !allowed.is_match(&e164) {
                        return Some((
                            number.to_string(),
                            format!(
                                "SMS number must match regex pattern set by the administrator: {}",
                                allowed
                            ),
                        ));
                    }
                }
            }
            Err(error) => return Some((number.to_string(), error)),
        }
    }

    None
}

/// Converts a delimited field of already-validated numbers to a unique E.164 list, preserving
/// first-seen order.
pub fn to_e164_list(field: &str, country_code: &str) -> Result<Vec<String>, String> {
    let mut result: Vec<String> = Vec::new();

    for number in split_recipients(field) {
        let e164 = number_to_e164(number, country_code)?;
        if !result.contains(&e164) {
            result.push(e164);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::{address_error, addresses_error, number_to_e164, to_e164_list};

    #[test]
    fn accepts_plain_address() {
        assert_eq!(address_error("user@example.com", None), None);
    }

    #[test]
    fn rejects_structurally_broken_addresses() {
        assert!(address_error("", None).is_some());
        assert!(address_error("short", None).is_some());
        assert!(address_error("no-at-sign.example.com", None).is_some());
        assert!(address_error("user@nodomain", None).is_some());
        assert!(address_error("usér@example.com", None).is_some());
    }

    #[test]
    fn enforces_allow_list() {
        let allowed = Regex::new(r"^[^@]+@example\.com$").unwrap();
        assert_eq!(address_error("user@example.com", Some(&allowed)), None);
        assert!(address_error("user@other.org", Some(&allowed)).is_some());
    }

    #[test]
    fn empty_field_rules() {
        assert_eq!(addresses_error("", true, None), None);
        assert!(addresses_error("", false, None).is_some());
    }

    #[test]
    fn splits_multiple_recipients() {
        let result = addresses_error("a@example.com, broken", false, None);
        let (address, _) = result.unwrap();
        assert_eq!(address, "broken");
    }

    #[test]
    fn normalizes_numbers_to_e164() {
        assert_eq!(number_to_e164("(206) 555-0100", "1").unwrap(), "+12065550100");
        assert_eq!(number_to_e164("+442071234567", "1").unwrap(), "+442071234567");
        assert!(number_to_e164("not-a-number", "1").is_err());
    }

    #[test]
    fn e164_list_is_unique_in_first_seen_order() {
        let list = to_e164_list("206-555-0100; +12065550100, 206-555-0101", "1").unwrap();
        assert_eq!(list, vec!["+12065550100", "+12065550101"]);
    }
}
