// SPDX-License-Identifier: AGPL-3.0-or-later

//! Builds the failure report email sent to the administrator (and optionally the subscriber)
//! when an alert cannot be processed.

use crate::alert::{Alert, AlertFailure};
use crate::config::Configuration;
use crate::errors::RowError;
use crate::render::RenderFormat;
use crate::transport::{Attachment, EmailPayload};

/// Composes the failure report for an alert from its accumulated error list.
///
/// Row-scoped errors render as an HTML table and cause the trigger data export to be attached,
/// so the author can line the two up. The report goes to the subscriber with the administrator
/// in CC, or to the administrator alone when subscriber notification is turned off.
pub fn compose_failure_report(alert: &Alert, config: &Configuration) -> EmailPayload {
    let mut row_errors: Vec<&RowError> = Vec::new();
    let mut general_errors: Vec<&str> = Vec::new();
    for failure in &alert.errors {
        match failure {
            AlertFailure::Row(error) => row_errors.push(error),
            AlertFailure::General(message) => general_errors.push(message),
        }
    }

    let mut body = format!(
        "<p>VizAlerts was unable to process alert <a href=\"{}\">{}</a>.</p>",
        alert.view_url(config, None),
        alert.view_name
    );

    if !general_errors.is_empty() {
        body.push_str("<p>Errors encountered:</p><ul>");
        for message in &general_errors {
            body.push_str(&format!("<li>{}</li>", message));
        }
        body.push_str("</ul>");
    }

    if !row_errors.is_empty() {
        body.push_str(
            "<p>Invalid data found in the trigger view (attached):</p>\
             <table border=\"1\"><tr><th>Row</th><th>Field</th><th>Value</th><th>Error</th></tr>",
        );
        for error in &row_errors {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                error.row, error.field, error.value, error.error
            ));
        }
        body.push_str("</table>");
    }

    body.push_str(&format!(
        "<br><p>Alert details:</p><ul>\
         <li>View: {}</li>\
         <li>Site: {}</li>\
         <li>Subscriber: {} ({})</li>\
         <li>View owner: {} ({})</li>\
         </ul>",
        alert.view_url_suffix,
        if alert.site_name.is_empty() {
            "Default"
        } else {
            &alert.site_name
        },
        alert.subscriber_email,
        alert.subscriber_sysname,
        alert.owner_email,
        alert.owner_sysname,
    ));

    let appended_attachments = if row_errors.is_empty() {
        Vec::new()
    } else {
        vec![Attachment {
            reference: None,
            filename: None,
            path: alert.trigger_data_file.clone(),
            format: RenderFormat::Csv,
            merge_pdf: false,
        }]
    };

    let (to, cc) = if config.notify_subscriber_on_failure {
        (
            alert.subscriber_email.clone(),
            Some(config.smtp_address_to.clone()),
        )
    } else {
        (config.smtp_address_to.clone(), None)
    };

    EmailPayload {
        from: config.smtp_address_from.clone(),
        to,
        cc,
        bcc: None,
        subject: format!("VizAlerts was unable to process alert {}", alert.view_name),
        body,
        inline_attachments: Vec::new(),
        appended_attachments,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::compose_failure_report;
    use crate::alert::Alert;
    use crate::config::Configuration;
    use crate::errors::RowError;

    fn test_alert() -> Alert {
        Alert::new(
            "alerts/overdue",
            "",
            "Overdue Items",
            "sub@example.com",
            "subscriber",
            None,
            "owner@example.com",
            "owner",
            PathBuf::from("/tmp/trigger.csv"),
        )
    }

    fn config() -> Configuration {
        Configuration {
            smtp_address_from: "noreply@example.com".into(),
            smtp_address_to: "admin@example.com".into(),
            ..Configuration::default()
        }
    }

    #[test]
    fn row_errors_render_as_table_with_trigger_data_attached() {
        let mut alert = test_alert();
        alert.push_row_errors(vec![RowError {
            row: 3,
            field: "Email To *".into(),
            value: "broken".into(),
            error: "Address has too few parts".into(),
        }]);

        let payload = compose_failure_report(&alert, &config());

        assert_eq!(payload.to, "sub@example.com");
        assert_eq!(payload.cc.as_deref(), Some("admin@example.com"));
        assert_eq!(
            payload.subject,
            "VizAlerts was unable to process alert Overdue Items"
        );
        assert!(payload.body.contains("<td>3</td>"));
        assert!(payload.body.contains("Address has too few parts"));
        assert_eq!(payload.appended_attachments.len(), 1);
        assert_eq!(
            payload.appended_attachments[0].path,
            PathBuf::from("/tmp/trigger.csv")
        );
    }

    #[test]
    fn general_errors_carry_no_attachment() {
        let mut alert = test_alert();
        alert.push_error("render failed");

        let payload = compose_failure_report(&alert, &config());

        assert!(payload.body.contains("<li>render failed</li>"));
        assert!(payload.appended_attachments.is_empty());
    }

    #[test]
    fn subscriber_copy_follows_configuration() {
        let mut alert = test_alert();
        alert.push_error("boom");
        let mut config = config();
        config.notify_subscriber_on_failure = false;

        let payload = compose_failure_report(&alert, &config);
        assert_eq!(payload.to, "admin@example.com");
        assert_eq!(payload.cc, None);
    }
}
