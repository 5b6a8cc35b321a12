// SPDX-License-Identifier: AGPL-3.0-or-later

//! Extracts all distinct content references from trigger text and resolves each to exactly one
//! rendered artifact.
//!
//! The invariant upheld here is one render call per distinct reference string, never more: rows
//! routinely repeat the same token hundreds of times, and every occurrence must map to the same
//! artifact path afterwards.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::AlertError;
use crate::reference::parser::{parse_reference, ContentReference};
use crate::render::{render_with_retry, Renderer};
use crate::trigger::Row;

/// Token shapes permitted inline in body, header and footer text.
static INLINE_TOKENS: Lazy<Regex> = Lazy::new(|| {
    // Unwrap is safe, pattern is static
    Regex::new(r"VIZ_IMAGE\(.*?\)|VIZ_LINK\(.*?\)").unwrap()
});

/// Token shapes permitted in attachment columns.
static ATTACHMENT_TOKENS: Lazy<Regex> = Lazy::new(|| {
    // Unwrap is safe, pattern is static
    Regex::new(r"VIZ_IMAGE\(.*?\)|VIZ_CSV\(.*?\)|VIZ_PDF\(.*?\)|VIZ_TWB\(.*?\)").unwrap()
});

/// Token shapes permitted in SMS message columns: plain text can only carry links.
static SMS_TOKENS: Lazy<Regex> = Lazy::new(|| {
    // Unwrap is safe, pattern is static
    Regex::new(r"VIZ_LINK\(.*?\)").unwrap()
});

/// Which token shapes a text field may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanShape {
    /// Body, header, footer: inline images and links.
    Inline,

    /// Attachment columns: everything that renders to a file.
    Attachment,

    /// SMS message columns: links only.
    SmsMessage,
}

impl ScanShape {
    pub(crate) fn regex(&self) -> &'static Regex {
        match self {
            Self::Inline => &INLINE_TOKENS,
            Self::Attachment => &ATTACHMENT_TOKENS,
            Self::SmsMessage => &SMS_TOKENS,
        }
    }
}

/// One enabled text field to scan: a trigger data column plus the token shapes it may carry.
#[derive(Debug, Clone)]
pub struct ScanField {
    pub column: String,
    pub shape: ScanShape,
}

/// Lookup of all content references found in a batch of trigger text, keyed by the raw reference
/// string. Populated once before task execution begins, read-only afterwards.
#[derive(Debug, Default)]
pub struct ReferenceRegistry {
    entries: HashMap<String, ContentReference>,
}

impl ReferenceRegistry {
    /// Returns the reference for a raw token string.
    pub fn get(&self, raw: &str) -> Option<&ContentReference> {
        self.entries.get(raw)
    }

    /// Returns the number of distinct references.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ContentReference> {
        self.entries.values()
    }
}

/// Scans every enabled text field of every row for reference tokens, parses each distinct token
/// once and renders each distinct non-link reference exactly once.
///
/// A reference that cannot be parsed or rendered fails the whole alert: substitution later would
/// silently omit content otherwise.
pub async fn extract_and_resolve(
    rows: &[Row],
    fields: &[ScanField],
    trigger_locator: &str,
    renderer: &dyn Renderer,
    tries: u32,
) -> Result<ReferenceRegistry, AlertError> {
    // Distinct raw tokens in encounter order, so render requests stay deterministic
    let mut order: Vec<String> = Vec::new();
    let mut entries: HashMap<String, ContentReference> = HashMap::new();

    for row in rows {
        for field in fields {
            let text = row.value(&field.column);
            for token in field.shape.regex().find_iter(text) {
                let raw = token.as_str();
                if !entries.contains_key(raw) {
                    debug!("Found content reference {}", raw);
                    let reference = parse_reference(raw, trigger_locator)?;
                    order.push(raw.to_string());
                    entries.insert(raw.to_string(), reference);
                }
            }
        }
    }

    for raw in &order {
        // Unwrap is safe, every key in `order` was inserted above
        let reference = entries.get_mut(raw).unwrap();
        if let Some(format) = reference.kind.format() {
            let artifact =
                render_with_retry(renderer, &reference.locator, format, tries).await?;
            reference.artifact = Some(artifact);
        }
    }

    Ok(ReferenceRegistry { entries })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::{extract_and_resolve, ScanField, ScanShape};
    use crate::render::{RenderFormat, Renderer};
    use crate::trigger::Row;

    const TRIGGER: &str = "alerts/overdue";

    #[derive(Default)]
    struct CountingRenderer {
        calls: AtomicU32,
        locators: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Renderer for CountingRenderer {
        async fn render(&self, locator: &str, format: RenderFormat) -> anyhow::Result<PathBuf> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            self.locators.lock().unwrap().push(locator.to_string());
            Ok(PathBuf::from(format!(
                "/tmp/artifact-{}.{}",
                call,
                format.extension()
            )))
        }
    }

    fn body_row(text: &str) -> Row {
        Row::new(vec![("Email Body".into(), text.into())])
    }

    fn body_field() -> Vec<ScanField> {
        vec![ScanField {
            column: "Email Body".into(),
            shape: ScanShape::Inline,
        }]
    }

    #[tokio::test]
    async fn renders_each_distinct_reference_once() {
        let renderer = CountingRenderer::default();
        let rows = vec![
            body_row("see VIZ_IMAGE() and again VIZ_IMAGE()"),
            body_row("still VIZ_IMAGE() here"),
        ];

        let registry = extract_and_resolve(&rows, &body_field(), TRIGGER, &renderer, 1)
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(renderer.calls.load(Ordering::Relaxed), 1);
        assert!(registry.get("VIZ_IMAGE()").unwrap().artifact.is_some());
    }

    #[tokio::test]
    async fn distinct_reference_strings_render_separately() {
        let renderer = CountingRenderer::default();
        let rows = vec![body_row(
            "VIZ_IMAGE(sales/east) and VIZ_IMAGE(sales/west) and VIZ_IMAGE(sales/east)",
        )];

        let registry = extract_and_resolve(&rows, &body_field(), TRIGGER, &renderer, 1)
            .await
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(renderer.calls.load(Ordering::Relaxed), 2);
        assert_eq!(
            *renderer.locators.lock().unwrap(),
            vec!["sales/east", "sales/west"]
        );
    }

    #[tokio::test]
    async fn links_are_never_rendered() {
        let renderer = CountingRenderer::default();
        let rows = vec![body_row("open VIZ_LINK(sales/summary) for details")];

        let registry = extract_and_resolve(&rows, &body_field(), TRIGGER, &renderer, 1)
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(renderer.calls.load(Ordering::Relaxed), 0);
        let entry = registry.get("VIZ_LINK(sales/summary)").unwrap();
        assert!(entry.artifact.is_none());
        assert_eq!(entry.locator, "sales/summary");
    }

    #[tokio::test]
    async fn attachment_shape_accepts_file_kinds_only() {
        let renderer = CountingRenderer::default();
        let rows = vec![Row::new(vec![(
            "Email Attachment".into(),
            "VIZ_CSV() VIZ_PDF() VIZ_LINK(ignored/here)".into(),
        )])];
        let fields = vec![ScanField {
            column: "Email Attachment".into(),
            shape: ScanShape::Attachment,
        }];

        let registry = extract_and_resolve(&rows, &fields, TRIGGER, &renderer, 1)
            .await
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("VIZ_LINK(ignored/here)").is_none());
    }

    #[tokio::test]
    async fn render_failure_fails_the_extraction() {
        struct FailingRenderer;

        #[async_trait::async_trait]
        impl Renderer for FailingRenderer {
            async fn render(
                &self,
                _locator: &str,
                _format: RenderFormat,
            ) -> anyhow::Result<PathBuf> {
                anyhow::bail!("server unreachable")
            }
        }

        let rows = vec![body_row("VIZ_IMAGE()")];
        let result = extract_and_resolve(&rows, &body_field(), TRIGGER, &FailingRenderer, 2).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn parse_error_aborts_before_any_render() {
        let renderer = CountingRenderer::default();
        let rows = vec![body_row("VIZ_IMAGE(|filename=../escape) VIZ_IMAGE()")];

        let result = extract_and_resolve(&rows, &body_field(), TRIGGER, &renderer, 1).await;

        assert!(result.is_err());
        assert_eq!(renderer.calls.load(Ordering::Relaxed), 0);
    }
}
