// SPDX-License-Identifier: AGPL-3.0-or-later

//! Drives one alert through the full pipeline: read trigger data, match and validate action
//! fields, resolve content references, consolidate, assemble, execute tasks and report failures.
//!
//! Errors never bubble out of the runner. Every problem is recorded on the alert, later stages
//! are skipped and a failure report is sent instead.

use log::{debug, error, info, warn};
use regex::Regex;

use crate::alert::assemble::{assemble_email_group, assemble_sms_row};
use crate::alert::consolidate::dedup_and_sort;
use crate::alert::fields::{Capabilities, FieldKey};
use crate::alert::report::compose_failure_report;
use crate::alert::{ActionKind, Alert, AlertType};
use crate::context::Context;
use crate::dispatch::{Task, TaskPayload, TaskQueue, TaskStatus};
use crate::errors::{AlertError, RowError};
use crate::reference::{extract_and_resolve, ScanField, ScanShape};
use crate::render::{render_with_retry, RenderFormat};
use crate::transport::{addresses_error, numbers_error, Attachment, EmailPayload};
use crate::trigger::{Row, RowSet};

/// Evaluates alerts against the shared context.
#[derive(Debug)]
pub struct AlertRunner {
    context: Context,
}

impl AlertRunner {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// Runs one alert to completion and returns the executed tasks, each in a terminal status.
    ///
    /// An empty result with errors recorded on the alert means the pipeline stopped before any
    /// task was enqueued; the failure report has been sent in that case.
    pub async fn run(&self, alert: &mut Alert) -> Vec<Task> {
        info!("Processing alert for view {}", alert.view_name);

        let config = &self.context.config;

        let data = match RowSet::from_path(&alert.trigger_data_file) {
            Ok(data) => data,
            Err(err) => {
                alert.push_error(format!("Error reading trigger data: {}", err));
                self.send_failure_report(alert).await;
                return Vec::new();
            }
        };

        if data.len() > config.viz_data_maxrows {
            alert.push_error(format!(
                "Trigger data has {} rows: {}. Add a filter to the trigger view to reduce the \
                 number of rows",
                data.len(),
                AlertError::TooManyRows {
                    max: config.viz_data_maxrows
                }
            ));
            self.send_failure_report(alert).await;
            return Vec::new();
        }

        if data.is_empty() {
            info!("Alert {} triggered no rows, nothing to do", alert.view_name);
            return Vec::new();
        }

        alert.fields.match_columns(data.headers());
        alert.alert_type = if alert.fields.any_action_matched() {
            AlertType::Advanced
        } else {
            AlertType::Simple
        };
        debug!("Alert {} is {:?}", alert.view_name, alert.alert_type);

        match alert.alert_type {
            AlertType::Simple => self.run_simple(alert).await,
            AlertType::Advanced => self.run_advanced(alert, &data).await,
        }
    }

    /// A simple alert renders the trigger view once and sends it to the subscriber with the
    /// trigger data attached.
    async fn run_simple(&self, alert: &mut Alert) -> Vec<Task> {
        let config = &self.context.config;

        let image = match render_with_retry(
            self.context.renderer.as_ref(),
            &alert.view_url_suffix,
            RenderFormat::Png,
            config.data_retrieval_tries,
        )
        .await
        {
            Ok(image) => image,
            Err(err) => {
                alert.push_error(format!(
                    "Alert was triggered, but encountered a failure rendering the view: {}",
                    err
                ));
                self.send_failure_report(alert).await;
                return Vec::new();
            }
        };

        let image_attachment = Attachment {
            reference: None,
            filename: None,
            path: image,
            format: RenderFormat::Png,
            merge_pdf: false,
        };
        let body = format!(
            "<a href=\"{}\"><img src=\"cid:{}\"></a>{}",
            alert.view_url(config, None),
            image_attachment.delivery_name(),
            alert.default_footer(config)
        );

        let payload = EmailPayload {
            from: config.smtp_address_from.clone(),
            to: alert.subscriber_email.clone(),
            cc: None,
            bcc: None,
            subject: format!("Alert triggered for {}", alert.view_name),
            body,
            inline_attachments: vec![image_attachment],
            appended_attachments: vec![Attachment {
                reference: None,
                filename: None,
                path: alert.trigger_data_file.clone(),
                format: RenderFormat::Csv,
                merge_pdf: false,
            }],
        };

        let queue = TaskQueue::new(self.context.clone());
        queue.enqueue(TaskPayload::Email(payload));
        self.execute_tasks(alert, queue).await
    }

    async fn run_advanced(&self, alert: &mut Alert, data: &RowSet) -> Vec<Task> {
        let config = &self.context.config;

        // Action alerts may only be authored by the view owner: anyone with subscribe rights
        // could impersonate arbitrary senders otherwise
        if alert.subscriber_sysname != alert.owner_sysname {
            alert.push_error(format!(
                "Alert subscriber {} is not the owner of the view, only the owner {} may use \
                 action fields",
                alert.subscriber_sysname, alert.owner_sysname
            ));
            self.send_failure_report(alert).await;
            return Vec::new();
        }

        let capabilities = Capabilities {
            email_enabled: config.email_action_enabled,
            sms_enabled: config.sms_action_enabled,
            sms_client: self.context.sms.is_some(),
        };
        let field_errors = alert.fields.validate(&capabilities);
        if !field_errors.is_empty() {
            alert.push_row_errors(field_errors);
            self.send_failure_report(alert).await;
            return Vec::new();
        }

        let data_errors = match self.validate_rows(alert, data.rows()) {
            Ok(errors) => errors,
            Err(message) => {
                alert.push_error(message);
                self.send_failure_report(alert).await;
                return Vec::new();
            }
        };
        if !data_errors.is_empty() {
            alert.push_row_errors(data_errors);
            self.send_failure_report(alert).await;
            return Vec::new();
        }

        let registry = match extract_and_resolve(
            data.rows(),
            &self.scan_fields(alert),
            &alert.view_url_suffix,
            self.context.renderer.as_ref(),
            config.data_retrieval_tries,
        )
        .await
        {
            Ok(registry) => registry,
            Err(err) => {
                alert.push_error(format!(
                    "Alert was triggered, but encountered a failure getting the referenced \
                     content: {}",
                    err
                ));
                self.send_failure_report(alert).await;
                return Vec::new();
            }
        };
        debug!("Resolved {} distinct content references", registry.len());

        let queue = TaskQueue::new(self.context.clone());

        if alert.fields.column(FieldKey::EmailAction).is_some() {
            let groups = dedup_and_sort(data.rows(), &alert.fields, ActionKind::Email);
            info!(
                "Alert {} produces {} email(s)",
                alert.view_name,
                groups.len()
            );
            for group in &groups {
                match assemble_email_group(alert, config, group, &registry) {
                    Ok(payload) => {
                        queue.enqueue(TaskPayload::Email(payload));
                    }
                    Err(err) => {
                        alert.push_error(format!("Unable to assemble email: {}", err));
                        self.send_failure_report(alert).await;
                        return Vec::new();
                    }
                }
            }
        }

        if alert.fields.column(FieldKey::SmsAction).is_some() {
            let groups = dedup_and_sort(data.rows(), &alert.fields, ActionKind::Sms);
            for group in &groups {
                match assemble_sms_row(alert, config, group, &registry) {
                    Ok(payloads) => {
                        for payload in payloads {
                            queue.enqueue(TaskPayload::Sms(payload));
                        }
                    }
                    Err(err) => {
                        alert.push_error(format!("Unable to assemble SMS: {}", err));
                        self.send_failure_report(alert).await;
                        return Vec::new();
                    }
                }
            }
        }

        self.execute_tasks(alert, queue).await
    }

    /// The text fields to scan for content references, per bound column.
    fn scan_fields(&self, alert: &Alert) -> Vec<ScanField> {
        let shapes = [
            (FieldKey::EmailBody, ScanShape::Inline),
            (FieldKey::EmailHeader, ScanShape::Inline),
            (FieldKey::EmailFooter, ScanShape::Inline),
            (FieldKey::EmailAttachment, ScanShape::Attachment),
            (FieldKey::SmsMessage, ScanShape::SmsMessage),
        ];
        shapes
            .iter()
            .filter_map(|(key, shape)| {
                alert.fields.column(*key).map(|column| ScanField {
                    column: column.to_string(),
                    shape: *shape,
                })
            })
            .collect()
    }

    /// Validates addresses and numbers of every row whose action flag is set. All problems are
    /// collected so the author sees the full picture at once.
    fn validate_rows(&self, alert: &Alert, rows: &[Row]) -> Result<Vec<RowError>, String> {
        let config = &self.context.config;
        let allowed_recipients = compile_allowed(&config.allowed_recipient_addresses)?;
        let allowed_from = compile_allowed(&config.allowed_from_addresses)?;
        let allowed_numbers = compile_allowed(&config.allowed_recipient_numbers)?;

        let mut errors = Vec::new();
        let mut check = |row_number: usize, key: FieldKey, result: Option<(String, String)>| {
            if let Some((value, message)) = result {
                errors.push(RowError {
                    row: row_number,
                    field: key.user_facing_name(),
                    value,
                    error: message,
                });
            }
        };

        let email_flag = alert.fields.column(FieldKey::EmailAction);
        let sms_flag = alert.fields.column(FieldKey::SmsAction);

        for (index, row) in rows.iter().enumerate() {
            // Trigger data rows start at 2, the header is row 1
            let row_number = index + 2;

            if email_flag.map(|column| row.value(column)) == Some("1") {
                if let Some(column) = alert.fields.column(FieldKey::EmailTo) {
                    check(
                        row_number,
                        FieldKey::EmailTo,
                        addresses_error(row.value(column), false, allowed_recipients.as_ref()),
                    );
                }
                if let Some(column) = alert.fields.column(FieldKey::EmailFrom) {
                    check(
                        row_number,
                        FieldKey::EmailFrom,
                        addresses_error(row.value(column), true, allowed_from.as_ref()),
                    );
                }
                for key in [FieldKey::EmailCc, FieldKey::EmailBcc] {
                    if let Some(column) = alert.fields.column(key) {
                        check(
                            row_number,
                            key,
                            addresses_error(row.value(column), true, allowed_recipients.as_ref()),
                        );
                    }
                }
            }

            if sms_flag.map(|column| row.value(column)) == Some("1") {
                if let Some(column) = alert.fields.column(FieldKey::SmsTo) {
                    check(
                        row_number,
                        FieldKey::SmsTo,
                        numbers_error(
                            row.value(column),
                            &config.phone_country_code,
                            allowed_numbers.as_ref(),
                        ),
                    );
                }
            }
        }

        Ok(errors)
    }

    /// Drains the queue and records every failed task on the alert.
    async fn execute_tasks(&self, alert: &mut Alert, queue: TaskQueue) -> Vec<Task> {
        let tasks = match queue.drain().await {
            Ok(tasks) => tasks,
            Err(err) => {
                alert.push_error(format!("Task execution was aborted: {}", err));
                self.send_failure_report(alert).await;
                return Vec::new();
            }
        };

        let mut any_failed = false;
        for task in &tasks {
            if task.status == TaskStatus::Failed {
                any_failed = true;
                alert.push_error(format!(
                    "Failed to send {} to {}: {}",
                    task.payload.kind(),
                    task.payload.recipient(),
                    task.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        if any_failed {
            self.send_failure_report(alert).await;
        }

        tasks
    }

    /// Sends the failure report. A transport problem at this point can only be logged.
    async fn send_failure_report(&self, alert: &Alert) {
        warn!(
            "Alert {} failed with {} error(s), sending failure report",
            alert.view_name,
            alert.errors.len()
        );
        let report = compose_failure_report(alert, &self.context.config);
        if let Err(err) = self.context.email.send(&report).await {
            error!(
                "Unable to deliver failure report for alert {}: {:#}",
                alert.view_name, err
            );
        }
    }
}

/// Compiles an administrator allow-list pattern. Empty patterns disable the check.
fn compile_allowed(pattern: &str) -> Result<Option<Regex>, String> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|err| format!("Invalid allow-list pattern {}: {}", pattern, err))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use tempfile::NamedTempFile;

    use super::AlertRunner;
    use crate::alert::{Alert, AlertType};
    use crate::config::Configuration;
    use crate::context::Context;
    use crate::dispatch::TaskStatus;
    use crate::render::{RenderFormat, Renderer};
    use crate::transport::{EmailPayload, EmailTransport, SmsPayload, SmsTransport};

    struct StubRenderer;

    #[async_trait::async_trait]
    impl Renderer for StubRenderer {
        async fn render(
            &self,
            locator: &str,
            format: RenderFormat,
        ) -> anyhow::Result<PathBuf> {
            let name = locator.replace(['/', '?', '='], "-");
            Ok(PathBuf::from(format!("/tmp/{}.{}", name, format.extension())))
        }
    }

    #[derive(Default)]
    struct RecordingEmail {
        sent: Mutex<Vec<EmailPayload>>,
        fail_to: Option<String>,
    }

    #[async_trait::async_trait]
    impl EmailTransport for RecordingEmail {
        async fn send(&self, payload: &EmailPayload) -> anyhow::Result<()> {
            if self.fail_to.as_deref() == Some(payload.to.as_str()) {
                anyhow::bail!("mailbox unavailable")
            }
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSms {
        sent: Mutex<Vec<SmsPayload>>,
    }

    #[async_trait::async_trait]
    impl SmsTransport for RecordingSms {
        async fn send(&self, payload: &SmsPayload) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct Harness {
        runner: AlertRunner,
        email: Arc<RecordingEmail>,
        sms: Arc<RecordingSms>,
        // Held so the trigger data file outlives the test
        _trigger: NamedTempFile,
    }

    fn harness(config: Configuration, email: RecordingEmail, data: &str) -> (Harness, Alert) {
        let mut trigger = NamedTempFile::new().unwrap();
        trigger.write_all(data.as_bytes()).unwrap();

        let email = Arc::new(email);
        let sms = Arc::new(RecordingSms::default());
        let context = Context::new(
            config,
            Arc::new(StubRenderer),
            email.clone(),
            Some(sms.clone()),
        );

        let alert = Alert::new(
            "alerts/overdue",
            "",
            "Overdue Items",
            "owner@example.com",
            "owner",
            None,
            "owner@example.com",
            "owner",
            trigger.path().to_path_buf(),
        );

        (
            Harness {
                runner: AlertRunner::new(context),
                email,
                sms,
                _trigger: trigger,
            },
            alert,
        )
    }

    fn config() -> Configuration {
        Configuration {
            // A single worker keeps delivery order deterministic for assertions
            worker_pool_size: 1,
            server: "reports.example.com".into(),
            smtp_address_from: "noreply@example.com".into(),
            smtp_address_to: "admin@example.com".into(),
            sms_action_enabled: true,
            ..Configuration::default()
        }
    }

    #[tokio::test]
    async fn simple_alert_sends_rendered_view_to_subscriber() {
        let data = "Region,Sales\nEast,100\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert_eq!(alert.alert_type, AlertType::Simple);
        assert_eq!(tasks.len(), 1);
        assert!(!alert.has_errors());

        let sent = harness.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "owner@example.com");
        assert_eq!(sent[0].subject, "Alert triggered for Overdue Items");
        assert!(sent[0].body.contains("cid:alerts-overdue.png"));
        assert_eq!(sent[0].inline_attachments.len(), 1);
        assert_eq!(sent[0].appended_attachments.len(), 1);
    }

    #[tokio::test]
    async fn empty_trigger_data_does_nothing() {
        let data = "Region,Sales\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert!(tasks.is_empty());
        assert!(!alert.has_errors());
        assert!(harness.email.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn advanced_alert_delivers_one_email_per_group() {
        let data = "Email Action,Email To,Email Subject,Email Body\n\
                    1,a@example.com,first,body one\n\
                    1,b@example.com,second,body two\n\
                    0,c@example.com,third,never\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert_eq!(alert.alert_type, AlertType::Advanced);
        assert_eq!(tasks.len(), 2);
        assert!(!alert.has_errors());

        let sent = harness.email.sent.lock().unwrap();
        let recipients: Vec<_> = sent.iter().map(|payload| payload.to.clone()).collect();
        assert_eq!(recipients, vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn advanced_alert_delivers_sms() {
        let data = "SMS Action *,SMS To *,SMS Message *\n\
                    1,206-555-0100,Check VIZ_LINK() now\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert_eq!(tasks.len(), 1);
        assert!(!alert.has_errors(), "errors: {:?}", alert.errors);

        let sent = harness.sms.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+12065550100");
        assert!(sent[0]
            .body
            .contains("http://reports.example.com/views/alerts/overdue"));
    }

    #[tokio::test]
    async fn non_owner_cannot_use_action_fields() {
        let data = "Email Action,Email To,Email Subject,Email Body\n1,a@example.com,s,b\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);
        alert.subscriber_sysname = "somebody_else".into();

        let tasks = harness.runner.run(&mut alert).await;

        assert!(tasks.is_empty());
        assert!(alert.has_errors());

        // Only the failure report went out
        let sent = harness.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "owner@example.com");
    }

    #[tokio::test]
    async fn invalid_addresses_gate_all_delivery() {
        let data = "Email Action,Email To,Email Subject,Email Body\n\
                    1,good@example.com,s,b\n\
                    1,not-an-address,s,b\n";
        let (harness, mut alert) = harness(config(), RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert!(tasks.is_empty());
        assert!(alert.has_errors());

        let sent = harness.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "owner@example.com");
        assert!(sent[0].body.contains("not-an-address"));
        // Trigger data is attached for row-scoped problems
        assert_eq!(sent[0].appended_attachments.len(), 1);
    }

    #[tokio::test]
    async fn row_cap_fails_the_alert() {
        let mut data = String::from("Region\n");
        for i in 0..5 {
            data.push_str(&format!("{}\n", i));
        }
        let mut config = config();
        config.viz_data_maxrows = 3;
        let (harness, mut alert) = harness(config, RecordingEmail::default(), &data);

        let tasks = harness.runner.run(&mut alert).await;

        assert!(tasks.is_empty());
        assert!(alert.has_errors());
        let sent = harness.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("maximum rows of 3 exceeded"));
    }

    #[tokio::test]
    async fn failed_task_is_recorded_and_reported_without_stopping_siblings() {
        let data = "Email Action,Email To,Email Subject,Email Body\n\
                    1,broken@example.com,s,b\n\
                    1,fine@example.com,s,b\n";
        let email = RecordingEmail {
            fail_to: Some("broken@example.com".into()),
            ..RecordingEmail::default()
        };
        let (harness, mut alert) = harness(config(), email, data);

        let tasks = harness.runner.run(&mut alert).await;

        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Failed)
                .count(),
            1
        );
        assert!(alert.has_errors());

        let sent = harness.email.sent.lock().unwrap();
        // The surviving action email plus the failure report
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, "fine@example.com");
        assert_eq!(sent[1].to, "owner@example.com");
        assert!(sent[1].body.contains("Failed to send email to broken@example.com"));
    }

    #[tokio::test]
    async fn email_actions_can_be_disabled() {
        let data = "Email Action,Email To,Email Subject,Email Body\n1,a@example.com,s,b\n";
        let mut config = config();
        config.email_action_enabled = false;
        let (harness, mut alert) = harness(config, RecordingEmail::default(), data);

        let tasks = harness.runner.run(&mut alert).await;

        assert!(tasks.is_empty());
        let sent = harness.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("not allowed"));
    }
}
