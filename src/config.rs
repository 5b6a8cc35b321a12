// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use serde::Deserialize;

/// Configuration object holding all important variables throughout the application.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Hostname of the reporting server trigger views live on. Used to construct
    /// view URLs embedded in message bodies and footers.
    pub server: String,

    /// Whether view URLs should use HTTPS.
    pub server_ssl: bool,

    /// Number of concurrent workers which defines the maximum of send tasks which can be worked
    /// on simultaneously.
    ///
    /// Use a higher number when the transport endpoints tolerate many parallel connections.
    pub worker_pool_size: u32,

    /// How often a render call for a content reference may be attempted before the alert is
    /// failed. Retries cover transient network and auth errors only.
    pub data_retrieval_tries: u32,

    /// Timeout in seconds for a single render or transport call.
    pub timeout_seconds: u64,

    /// Maximum number of trigger data rows an alert may carry. Exceeding this count is an alert
    /// error: it usually means the trigger view lacks a filter.
    pub viz_data_maxrows: usize,

    /// Pixel dimensions used when rendering a view as PNG.
    pub viz_png_width: u32,
    pub viz_png_height: u32,

    /// Directory for temporary artifacts (rendered files, merged PDFs).
    pub temp_dir: PathBuf,

    /// Default From address for outgoing email, used when the trigger data provides none.
    pub smtp_address_from: String,

    /// Administrator address receiving failure reports.
    pub smtp_address_to: String,

    /// Optional regex which all From addresses must match. Empty disables the check.
    pub allowed_from_addresses: String,

    /// Optional regex which all recipient addresses must match. Empty disables the check.
    pub allowed_recipient_addresses: String,

    /// Whether email actions are permitted at all.
    pub email_action_enabled: bool,

    /// Whether SMS actions are permitted at all.
    pub sms_action_enabled: bool,

    /// Default From number for outgoing SMS.
    pub sms_from_number: String,

    /// Optional regex which all recipient numbers must match (tested against the E.164 form).
    /// Empty disables the check.
    pub allowed_recipient_numbers: String,

    /// ISO country calling code assumed for numbers given without a leading `+`.
    pub phone_country_code: String,

    /// Send failure reports to the subscriber (with the administrator in CC) instead of the
    /// administrator alone.
    pub notify_subscriber_on_failure: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            server_ssl: false,
            worker_pool_size: 4,
            data_retrieval_tries: 2,
            timeout_seconds: 60,
            viz_data_maxrows: 1000,
            viz_png_width: 1500,
            viz_png_height: 1500,
            temp_dir: std::env::temp_dir(),
            smtp_address_from: "alerts@localhost".into(),
            smtp_address_to: "admin@localhost".into(),
            allowed_from_addresses: String::new(),
            allowed_recipient_addresses: String::new(),
            email_action_enabled: true,
            sms_action_enabled: false,
            sms_from_number: String::new(),
            allowed_recipient_numbers: String::new(),
            phone_country_code: "1".into(),
            notify_subscriber_on_failure: true,
        }
    }
}
