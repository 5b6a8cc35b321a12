// SPDX-License-Identifier: AGPL-3.0-or-later

//! The alert aggregate and the pipeline evaluating it.

mod assemble;
mod consolidate;
mod fields;
mod report;
mod runner;

pub use consolidate::{dedup_and_sort, RowGroup};
pub use fields::{Capabilities, FieldKey, FieldMap};
pub use runner::AlertRunner;

use std::path::PathBuf;

use crate::config::Configuration;
use crate::errors::RowError;

/// Special token authors can embed in a footer column to pull in the generated default footer.
pub const DEFAULT_FOOTER_PLACEHOLDER: &str = "VIZALERTS_FOOTER()";

/// Action type a field (and ultimately a task) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Fields relevant to every action, such as the sort order.
    General,
    Email,
    Sms,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::General => "General",
            Self::Email => "Email",
            Self::Sms => "SMS",
        };
        write!(f, "{}", name)
    }
}

/// Whether an alert is a plain subscription or carries action fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    /// No action flag column matched: render the trigger view once and send it to the
    /// subscriber.
    Simple,

    /// At least one action flag column matched: the trigger data drives the outgoing messages.
    Advanced,
}

/// One problem recorded against an alert. Row-scoped problems keep their origin so the failure
/// report can render them as a table; everything else is free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertFailure {
    Row(RowError),
    General(String),
}

/// The root aggregate for one alert evaluation.
///
/// The alert accumulates every error encountered while processing; stage boundaries consult the
/// list to decide whether to proceed, and the failure report renders it. The alert outlives its
/// task queue and is dropped after the queue drains.
#[derive(Debug)]
pub struct Alert {
    /// Locator of the trigger view: `workbook/view`, optionally with query parameters.
    pub view_url_suffix: String,

    /// Site the trigger view lives on. Empty or `Default` means the default site.
    pub site_name: String,

    /// Display name of the trigger view, used in subjects and footers.
    pub view_name: String,

    pub subscriber_email: String,
    pub subscriber_sysname: String,

    /// Authentication domain of the subscriber, `None` for local accounts.
    pub subscriber_domain: Option<String>,

    pub owner_email: String,
    pub owner_sysname: String,

    /// Path of the downloaded trigger data export.
    pub trigger_data_file: PathBuf,

    pub alert_type: AlertType,

    /// Action field dictionary, populated during field matching.
    pub fields: FieldMap,

    /// Every error encountered so far.
    pub errors: Vec<AlertFailure>,
}

impl Alert {
    /// Returns a new alert for a trigger view and subscriber, with all action fields unmatched.
    pub fn new(
        view_url_suffix: impl Into<String>,
        site_name: impl Into<String>,
        view_name: impl Into<String>,
        subscriber_email: impl Into<String>,
        subscriber_sysname: impl Into<String>,
        subscriber_domain: Option<String>,
        owner_email: impl Into<String>,
        owner_sysname: impl Into<String>,
        trigger_data_file: PathBuf,
    ) -> Self {
        Self {
            view_url_suffix: view_url_suffix.into(),
            site_name: site_name.into(),
            view_name: view_name.into(),
            subscriber_email: subscriber_email.into(),
            subscriber_sysname: subscriber_sysname.into(),
            subscriber_domain,
            owner_email: owner_email.into(),
            owner_sysname: owner_sysname.into(),
            trigger_data_file,
            alert_type: AlertType::Simple,
            fields: FieldMap::new(),
            errors: Vec::new(),
        }
    }

    /// Constructs the full URL of a view. With no custom locator this is the trigger view
    /// itself; content references pass their own locators in.
    pub fn view_url(&self, config: &Configuration, custom_locator: Option<&str>) -> String {
        let scheme = if config.server_ssl { "https" } else { "http" };
        let locator = custom_locator.unwrap_or(&self.view_url_suffix);
        let site = self.site_name.replace("Default", "");

        if site.is_empty() {
            format!("{}://{}/views/{}", scheme, config.server, locator)
        } else {
            format!("{}://{}/t/{}/views/{}", scheme, config.server, site, locator)
        }
    }

    /// The generated footer appended to outgoing email bodies.
    pub fn default_footer(&self, config: &Configuration) -> String {
        let mut footer = format!(
            "<br><br><font size=\"2\"><i>This VizAlerts email generated on behalf of \
             <a href=\"mailto:{}\">{}</a>, from view <a href=\"{}\">{}</a></i></font>",
            self.subscriber_email,
            self.subscriber_sysname,
            self.view_url(config, None),
            self.view_name
        );

        if self.alert_type == AlertType::Simple {
            let scheme = if config.server_ssl { "https" } else { "http" };
            let domain = self.subscriber_domain.as_deref().unwrap_or("local");
            footer.push_str(&format!(
                "<br><font size=\"2\"><i><a href=\"{}://{}/#/user/{}/{}/subscriptions\">\
                 Manage my subscription settings</a></i></font>",
                scheme, config.server, domain, self.subscriber_sysname
            ));
        }

        footer
    }

    /// The plain-text footer appended to outgoing SMS bodies.
    pub fn sms_footer(&self) -> String {
        format!(" This VizAlerts SMS sent on behalf of {}", self.subscriber_email)
    }

    /// Records a general (non-row-scoped) error.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(AlertFailure::General(message.into()));
    }

    /// Records a batch of row-scoped validation errors.
    pub fn push_row_errors(&mut self, errors: Vec<RowError>) {
        self.errors.extend(errors.into_iter().map(AlertFailure::Row));
    }

    /// True when any error has been recorded so far. Stage boundaries gate on this.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
