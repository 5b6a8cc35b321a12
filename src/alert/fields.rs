// SPDX-License-Identifier: AGPL-3.0-or-later

//! The action field dictionary: the fixed set of known action fields, the patterns matching them
//! against trigger data columns and the structural validation of what matched.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::alert::ActionKind;
use crate::errors::RowError;

/// Every known action field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKey {
    SortOrder,
    EmailAction,
    EmailTo,
    EmailFrom,
    EmailCc,
    EmailBcc,
    EmailSubject,
    EmailBody,
    EmailHeader,
    EmailFooter,
    EmailAttachment,
    EmailConsolidate,
    SmsAction,
    SmsTo,
    SmsFrom,
    SmsMessage,
}

impl FieldKey {
    /// All keys, in the order they are matched and validated.
    pub const ALL: [FieldKey; 16] = [
        FieldKey::SortOrder,
        FieldKey::EmailAction,
        FieldKey::EmailTo,
        FieldKey::EmailFrom,
        FieldKey::EmailCc,
        FieldKey::EmailBcc,
        FieldKey::EmailSubject,
        FieldKey::EmailBody,
        FieldKey::EmailHeader,
        FieldKey::EmailFooter,
        FieldKey::EmailAttachment,
        FieldKey::EmailConsolidate,
        FieldKey::SmsAction,
        FieldKey::SmsTo,
        FieldKey::SmsFrom,
        FieldKey::SmsMessage,
    ];

    /// Canonical display name of the field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SortOrder => "Sort Order",
            Self::EmailAction => "Email Action",
            Self::EmailTo => "Email To",
            Self::EmailFrom => "Email From",
            Self::EmailCc => "Email CC",
            Self::EmailBcc => "Email BCC",
            Self::EmailSubject => "Email Subject",
            Self::EmailBody => "Email Body",
            Self::EmailHeader => "Email Header",
            Self::EmailFooter => "Email Footer",
            Self::EmailAttachment => "Email Attachment",
            Self::EmailConsolidate => "Email Consolidate",
            Self::SmsAction => "SMS Action",
            Self::SmsTo => "SMS To",
            Self::SmsFrom => "SMS From",
            Self::SmsMessage => "SMS Message",
        }
    }

    /// Column name pattern. Matched case-insensitively and anchored at the start, so a leading
    /// space (the rename marker some exports add) and trailing qualifiers are tolerated.
    fn pattern(&self) -> &'static str {
        match self {
            Self::SortOrder => r".*Sort.Order",
            Self::EmailAction => r" ?Email.Action",
            Self::EmailTo => r" ?Email.To",
            Self::EmailFrom => r" ?Email.From",
            Self::EmailCc => r" ?Email.CC",
            Self::EmailBcc => r" ?Email.BCC",
            Self::EmailSubject => r" ?Email.Subject",
            Self::EmailBody => r" ?Email.Body",
            Self::EmailHeader => r" ?Email.Header",
            Self::EmailFooter => r" ?Email.Footer",
            Self::EmailAttachment => r" ?Email.Attachment",
            Self::EmailConsolidate => r" ?Email.Consolidate",
            Self::SmsAction => r" ?SMS.Action.\*",
            Self::SmsTo => r" ?SMS.To.\*",
            Self::SmsFrom => r" ?SMS.From.~",
            Self::SmsMessage => r" ?SMS.Message.\*",
        }
    }

    /// The action this field belongs to.
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SortOrder => ActionKind::General,
            Self::SmsAction | Self::SmsTo | Self::SmsFrom | Self::SmsMessage => ActionKind::Sms,
            _ => ActionKind::Email,
        }
    }

    /// Whether the field must be present once the action's flag field matched.
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            Self::EmailAction
                | Self::EmailTo
                | Self::EmailSubject
                | Self::EmailBody
                | Self::SmsAction
                | Self::SmsTo
                | Self::SmsMessage
        )
    }

    /// Whether the field is the flag enabling its action.
    pub fn is_action_flag(&self) -> bool {
        matches!(self, Self::EmailAction | Self::SmsAction)
    }

    /// User-facing name with the required (`*`) or optional (`~`) marker alert authors know from
    /// the documentation.
    pub fn user_facing_name(&self) -> String {
        if self.is_required() {
            format!("{} *", self.name())
        } else {
            format!("{} ~", self.name())
        }
    }
}

/// The flag field of an action kind, `None` for General.
fn flag_key(kind: ActionKind) -> Option<FieldKey> {
    match kind {
        ActionKind::General => None,
        ActionKind::Email => Some(FieldKey::EmailAction),
        ActionKind::Sms => Some(FieldKey::SmsAction),
    }
}

static PATTERNS: Lazy<Vec<(FieldKey, Regex)>> = Lazy::new(|| {
    FieldKey::ALL
        .iter()
        .map(|key| {
            // Unwrap is safe, patterns are static
            let regex = RegexBuilder::new(&format!("^{}", key.pattern()))
                .case_insensitive(true)
                .build()
                .unwrap();
            (*key, regex)
        })
        .collect()
});

/// Which action capabilities are available, per administrator settings and runtime wiring.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub email_enabled: bool,
    pub sms_enabled: bool,

    /// Whether an SMS transport is actually wired in. Enabled-but-unwired is its own error so
    /// the alert author knows whom to ask.
    pub sms_client: bool,
}

/// State of one action field after matching against the trigger data columns.
#[derive(Debug, Clone, Default)]
pub struct ActionField {
    /// Every column name whose start matched the field pattern.
    pub matches: Vec<String>,

    /// Validation problems recorded against this field.
    pub errors: Vec<String>,

    /// The single column this field is bound to. Set only when exactly one column matched and no
    /// error was recorded.
    pub column: Option<String>,
}

impl ActionField {
    fn matched(&self) -> bool {
        !self.matches.is_empty()
    }
}

/// Dictionary of all action fields for one alert.
#[derive(Debug, Default)]
pub struct FieldMap {
    fields: HashMap<FieldKey, ActionField>,
}

impl FieldMap {
    pub fn new() -> Self {
        let fields = FieldKey::ALL
            .iter()
            .map(|key| (*key, ActionField::default()))
            .collect();
        Self { fields }
    }

    /// Returns the state of one field.
    pub fn field(&self, key: FieldKey) -> &ActionField {
        // Unwrap is safe, the map is populated with every key at construction
        self.fields.get(&key).unwrap()
    }

    fn field_mut(&mut self, key: FieldKey) -> &mut ActionField {
        // Unwrap is safe, the map is populated with every key at construction
        self.fields.get_mut(&key).unwrap()
    }

    /// Returns the bound column of a field, when it has one.
    pub fn column(&self, key: FieldKey) -> Option<&str> {
        self.field(key).column.as_deref()
    }

    /// Matches every known field against the trigger data columns.
    pub fn match_columns(&mut self, headers: &[String]) {
        for (key, regex) in PATTERNS.iter() {
            let matches: Vec<String> = headers
                .iter()
                .filter(|header| regex.is_match(header))
                .cloned()
                .collect();
            if !matches.is_empty() {
                debug!("Field {} matched columns {:?}", key.name(), matches);
            }
            self.field_mut(*key).matches = matches;
        }
    }

    /// True when the flag field of a kind matched a column.
    pub fn flag_matched(&self, kind: ActionKind) -> bool {
        flag_key(kind).map_or(false, |key| self.field(key).matched())
    }

    /// True when any action flag field matched, which is what makes an alert advanced.
    pub fn any_action_matched(&self) -> bool {
        FieldKey::ALL
            .iter()
            .any(|key| key.is_action_flag() && self.field(*key).matched())
    }

    /// Validates the matched fields structurally and binds each error-free, uniquely matched
    /// field to its column.
    ///
    /// All problems are reported against row 1, the header row: they are defects of the trigger
    /// view itself rather than of any data row.
    pub fn validate(&mut self, capabilities: &Capabilities) -> Vec<RowError> {
        for key in FieldKey::ALL.iter() {
            let kind = key.kind();
            let matched = self.field(*key).matched();

            if matched {
                match kind {
                    ActionKind::Email if !capabilities.email_enabled => {
                        self.field_mut(*key).errors.push(
                            "Email actions are not allowed for this alert, per administrative \
                             settings"
                                .into(),
                        );
                    }
                    ActionKind::Sms if !capabilities.sms_enabled => {
                        self.field_mut(*key)
                            .errors
                            .push("SMS actions are not enabled, per administrative settings".into());
                    }
                    ActionKind::Sms if !capabilities.sms_client => {
                        self.field_mut(*key).errors.push(
                            "SMS actions cannot be processed right now, no valid SMS client. \
                             Please contact your administrator"
                                .into(),
                        );
                    }
                    _ => {}
                }

                let matches = self.field(*key).matches.clone();
                if matches.len() > 1 {
                    self.field_mut(*key).errors.push(format!(
                        "Multiple matches found for field {}. Found: {}",
                        key.name(),
                        matches.join(", ")
                    ));
                }

                if *key == FieldKey::EmailConsolidate {
                    let foreign_flag = FieldKey::ALL.iter().any(|other| {
                        other.is_action_flag()
                            && other.kind() != ActionKind::Email
                            && self.field(*other).matched()
                    });
                    if foreign_flag {
                        self.field_mut(*key).errors.push(
                            "Email Consolidate may not be used with any action except Email".into(),
                        );
                    }
                }
            } else if key.is_required() && self.flag_matched(kind) && !key.is_action_flag() {
                self.field_mut(*key).errors.push(format!(
                    "Could not find required field {} for {} actions",
                    key.user_facing_name(),
                    kind
                ));
            }
        }

        let mut errors = Vec::new();
        for key in FieldKey::ALL.iter() {
            let field = self.field_mut(*key);
            if field.errors.is_empty() {
                if field.matches.len() == 1 {
                    field.column = Some(field.matches[0].clone());
                }
            } else {
                for error in &field.errors {
                    errors.push(RowError {
                        row: 1,
                        field: key.user_facing_name(),
                        value: field.matches.join(", "),
                        error: error.clone(),
                    });
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{Capabilities, FieldKey, FieldMap};
    use crate::alert::ActionKind;

    fn all_enabled() -> Capabilities {
        Capabilities {
            email_enabled: true,
            sms_enabled: true,
            sms_client: true,
        }
    }

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[rstest]
    #[case("Email Action", FieldKey::EmailAction)]
    #[case(" Email Action (copy)", FieldKey::EmailAction)]
    #[case("email to", FieldKey::EmailTo)]
    #[case("SMS Action *", FieldKey::SmsAction)]
    #[case("My Sort Order", FieldKey::SortOrder)]
    fn column_names_match_their_field(#[case] column: &str, #[case] key: FieldKey) {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&[column]));
        assert_eq!(fields.field(key).matches, vec![column.to_string()]);
    }

    #[test]
    fn unrelated_columns_match_nothing() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&["Region", "Sales", "My Email To"]));
        assert!(!fields.any_action_matched());
        assert!(!fields.field(FieldKey::EmailTo).matched());
    }

    #[test]
    fn binds_unique_error_free_matches() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&[
            "Email Action",
            "Email To",
            "Email Subject",
            "Email Body",
        ]));
        let errors = fields.validate(&all_enabled());

        assert!(errors.is_empty());
        assert_eq!(fields.column(FieldKey::EmailTo), Some("Email To"));
        assert!(fields.flag_matched(ActionKind::Email));
    }

    #[test]
    fn multiple_matches_are_an_error() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&[
            "Email Action",
            "Email To",
            "Email To (copy)",
            "Email Subject",
            "Email Body",
        ]));
        let errors = fields.validate(&all_enabled());

        assert!(errors.iter().any(|e| e.error.contains("Multiple matches")));
        assert_eq!(fields.column(FieldKey::EmailTo), None);
    }

    #[test]
    fn missing_required_field_is_an_error_once_flag_matched() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&["Email Action", "Email To", "Email Subject"]));
        let errors = fields.validate(&all_enabled());

        assert!(errors
            .iter()
            .any(|e| e.field == "Email Body *" && e.error.contains("required")));
    }

    #[test]
    fn disabled_action_kind_is_an_error() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&[
            "SMS Action *",
            "SMS To *",
            "SMS Message *",
        ]));
        let errors = fields.validate(&Capabilities {
            email_enabled: true,
            sms_enabled: false,
            sms_client: false,
        });

        assert!(errors.iter().any(|e| e.error.contains("not enabled")));
    }

    #[test]
    fn sms_enabled_without_client_is_its_own_error() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&["SMS Action *", "SMS To *", "SMS Message *"]));
        let errors = fields.validate(&Capabilities {
            email_enabled: true,
            sms_enabled: true,
            sms_client: false,
        });

        assert!(errors.iter().any(|e| e.error.contains("no valid SMS client")));
    }

    #[test]
    fn consolidate_requires_email_only() {
        let mut fields = FieldMap::new();
        fields.match_columns(&headers(&[
            "Email Action",
            "Email To",
            "Email Subject",
            "Email Body",
            "Email Consolidate",
            "SMS Action *",
            "SMS To *",
            "SMS Message *",
        ]));
        let errors = fields.validate(&all_enabled());

        assert!(errors
            .iter()
            .any(|e| e.error.contains("may not be used with any action except Email")));
    }
}
