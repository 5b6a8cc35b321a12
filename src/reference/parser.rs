// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tokenizer and argument parser for content reference strings.
//!
//! A reference has the shape `KIND(body)` where `KIND` is one of the `VIZ_*` tags. The body is
//! empty, a single target locator, or a `|`-delimited list whose first element is the (possibly
//! empty) locator and whose remaining elements are arguments:
//!
//! ```text
//! VIZ_IMAGE()
//! VIZ_PDF(workbook/view?Region=East)
//! VIZ_CSV(?Region=East|filename=east region)
//! VIZ_LINK(workbook/view|rawlink)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ReferenceError;
use crate::render::RenderFormat;

/// Argument names recognized inside a reference body. Unknown prefixes are ignored so newer
/// producers stay compatible with older engines.
const FILENAME_ARGUMENT: &str = "filename=";
const EXPORTFILEPATH_ARGUMENT: &str = "exportfilepath=";
const MERGEPDF_ARGUMENT: &str = "mergepdf";
const VIZLINK_ARGUMENT: &str = "vizlink";
const RAWLINK_ARGUMENT: &str = "rawlink";

const ARGUMENT_DELIMITER: char = '|';

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    // Unwrap is safe, pattern is static
    Regex::new(r"^VIZ_(IMAGE|PDF|CSV|TWB|LINK)\((.*)\)$").unwrap()
});

/// What a content reference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Image,
    Pdf,
    Csv,
    Twb,
    Link,
}

impl ReferenceKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "IMAGE" => Some(Self::Image),
            "PDF" => Some(Self::Pdf),
            "CSV" => Some(Self::Csv),
            "TWB" => Some(Self::Twb),
            "LINK" => Some(Self::Link),
            _ => None,
        }
    }

    /// Artifact format this kind renders to. `IMAGE` maps to PNG; links are never rendered.
    pub fn format(&self) -> Option<RenderFormat> {
        match self {
            Self::Image => Some(RenderFormat::Png),
            Self::Pdf => Some(RenderFormat::Pdf),
            Self::Csv => Some(RenderFormat::Csv),
            Self::Twb => Some(RenderFormat::Twb),
            Self::Link => None,
        }
    }
}

/// One distinct content reference found in trigger text, identified by its raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentReference {
    /// The raw reference string as it appears in the text. Identity and dedup key.
    pub raw: String,

    /// Reference kind.
    pub kind: ReferenceKind,

    /// Resolved target locator: `workbook/view[?params]`.
    pub locator: String,

    /// Custom output filename, already suffixed with the artifact extension for non-link kinds.
    pub filename: Option<String>,

    /// Optional export location (accepted and validated, not acted on yet).
    pub export_file_path: Option<String>,

    /// Merge this PDF with others sharing its filename.
    pub merge_pdf: bool,

    /// Render an inline image as a clickable link to its view.
    pub viz_link: bool,

    /// Render a link with no visible text, just the bare URL.
    pub raw_link: bool,

    /// Path of the rendered artifact. Set during resolution; always `None` for links.
    pub artifact: Option<std::path::PathBuf>,
}

/// Parses one reference token. `trigger_locator` is the alert's own view, substituted when the
/// body names no target of its own.
pub fn parse_reference(
    raw: &str,
    trigger_locator: &str,
) -> Result<ContentReference, ReferenceError> {
    let captures = TOKEN
        .captures(raw)
        .ok_or_else(|| ReferenceError::Malformed(raw.to_string()))?;

    // Unwraps are safe, both groups participate in every match
    let kind = ReferenceKind::from_tag(captures.get(1).unwrap().as_str())
        .ok_or_else(|| ReferenceError::Malformed(raw.to_string()))?;
    let body = captures.get(2).unwrap().as_str();

    let mut elements = body.split(ARGUMENT_DELIMITER);

    // First element is the target locator, possibly empty
    let locator = resolve_locator(elements.next().unwrap_or(""), trigger_locator);

    let mut reference = ContentReference {
        raw: raw.to_string(),
        kind,
        locator,
        filename: None,
        export_file_path: None,
        merge_pdf: false,
        viz_link: false,
        raw_link: false,
        artifact: None,
    };

    for element in elements {
        if let Some(filename) = element.strip_prefix(FILENAME_ARGUMENT) {
            let filename = validate_filename(filename, raw)?;
            reference.filename = Some(match kind.format() {
                Some(format) => format!("{}.{}", filename, format.extension()),
                None => filename,
            });
        } else if let Some(path) = element.strip_prefix(EXPORTFILEPATH_ARGUMENT) {
            reference.export_file_path = Some(validate_export_path(path, raw)?);
        } else if element.starts_with(MERGEPDF_ARGUMENT) {
            // Merging only makes sense for PDF output
            if kind == ReferenceKind::Pdf {
                reference.merge_pdf = true;
            }
        } else if element.starts_with(VIZLINK_ARGUMENT) {
            reference.viz_link = true;
        } else if element.starts_with(RAWLINK_ARGUMENT) {
            reference.raw_link = true;
        }
        // Anything else is an unknown argument and silently ignored
    }

    Ok(reference)
}

/// Target-locator resolution: empty means the trigger view itself, a leading `?` appends query
/// parameters to the trigger view, anything else is taken verbatim.
fn resolve_locator(element: &str, trigger_locator: &str) -> String {
    if element.is_empty() {
        trigger_locator.to_string()
    } else if element.starts_with('?') {
        format!("{}{}", trigger_locator, element)
    } else {
        element.to_string()
    }
}

/// Validates a custom output filename. Violations are hard parse errors which abort the whole
/// alert: a bad filename in trigger data is either a typo or an attempted path escape, and
/// neither may silently reach the filesystem.
fn validate_filename(filename: &str, reference: &str) -> Result<String, ReferenceError> {
    if filename.contains('\\') {
        return Err(ReferenceError::FilenameSeparator {
            filename: filename.to_string(),
            reference: reference.to_string(),
        });
    }

    if filename.starts_with('/') || has_drive_prefix(filename) {
        return Err(ReferenceError::FilenamePath {
            filename: filename.to_string(),
            reference: reference.to_string(),
        });
    }

    if filename.split('/').any(|component| component == "..") {
        return Err(ReferenceError::FilenamePath {
            filename: filename.to_string(),
            reference: reference.to_string(),
        });
    }

    let disallowed: String = filename
        .chars()
        .filter(|c| !is_allowed_filename_char(*c))
        .collect();
    if !disallowed.is_empty() {
        return Err(ReferenceError::FilenameCharacters {
            characters: disallowed,
            filename: filename.to_string(),
            reference: reference.to_string(),
        });
    }

    Ok(filename.to_string())
}

fn validate_export_path(path: &str, reference: &str) -> Result<String, ReferenceError> {
    let normalized = path.replace('\\', "/");

    if normalized.starts_with('/')
        || has_drive_prefix(&normalized)
        || normalized.split('/').any(|component| component == "..")
    {
        return Err(ReferenceError::ExportPath {
            path: path.to_string(),
            reference: reference.to_string(),
        });
    }

    Ok(normalized)
}

fn is_allowed_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '+' | '-')
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{parse_reference, ContentReference, ReferenceKind};
    use crate::errors::ReferenceError;

    const TRIGGER: &str = "alerts/overdue";

    fn parse(raw: &str) -> ContentReference {
        parse_reference(raw, TRIGGER).unwrap()
    }

    #[test]
    fn empty_body_targets_trigger_view() {
        let reference = parse("VIZ_IMAGE()");
        assert_eq!(reference.kind, ReferenceKind::Image);
        assert_eq!(reference.locator, TRIGGER);
        assert!(reference.artifact.is_none());
    }

    #[test]
    fn query_parameters_append_to_trigger_view() {
        let reference = parse("VIZ_PDF(?Region=East)");
        assert_eq!(reference.locator, "alerts/overdue?Region=East");
    }

    #[test]
    fn explicit_locator_is_verbatim() {
        let reference = parse("VIZ_CSV(sales/by-region?Region=West)");
        assert_eq!(reference.locator, "sales/by-region?Region=West");
    }

    #[test]
    fn empty_first_element_with_arguments_targets_trigger_view() {
        let reference = parse("VIZ_IMAGE(|filename=snapshot)");
        assert_eq!(reference.locator, TRIGGER);
        assert_eq!(reference.filename.as_deref(), Some("snapshot.png"));
    }

    #[rstest]
    #[case("VIZ_IMAGE()", ReferenceKind::Image)]
    #[case("VIZ_PDF()", ReferenceKind::Pdf)]
    #[case("VIZ_CSV()", ReferenceKind::Csv)]
    #[case("VIZ_TWB()", ReferenceKind::Twb)]
    #[case("VIZ_LINK()", ReferenceKind::Link)]
    fn recognizes_every_kind(#[case] raw: &str, #[case] kind: ReferenceKind) {
        assert_eq!(parse(raw).kind, kind);
    }

    #[test]
    fn filename_gets_format_extension_except_for_links() {
        assert_eq!(
            parse("VIZ_CSV(|filename=report 2024)").filename.as_deref(),
            Some("report 2024.csv")
        );
        assert_eq!(
            parse("VIZ_LINK(|filename=report 2024)").filename.as_deref(),
            Some("report 2024")
        );
    }

    #[test]
    fn traversal_filenames_are_rejected() {
        let err = parse_reference("VIZ_CSV(|filename=../../etc/passwd)", TRIGGER).unwrap_err();
        assert!(matches!(err, ReferenceError::FilenamePath { .. }));

        let err = parse_reference("VIZ_CSV(|filename=/etc/passwd)", TRIGGER).unwrap_err();
        assert!(matches!(err, ReferenceError::FilenamePath { .. }));

        let err = parse_reference("VIZ_CSV(|filename=C:autoexec)", TRIGGER).unwrap_err();
        assert!(matches!(err, ReferenceError::FilenamePath { .. }));
    }

    #[test]
    fn backslash_separator_is_rejected() {
        let err = parse_reference(r"VIZ_CSV(|filename=a\b)", TRIGGER).unwrap_err();
        assert!(matches!(err, ReferenceError::FilenameSeparator { .. }));
    }

    #[test]
    fn odd_characters_are_rejected() {
        let err = parse_reference("VIZ_CSV(|filename=rm;-rf)", TRIGGER).unwrap_err();
        match err {
            ReferenceError::FilenameCharacters { characters, .. } => {
                assert_eq!(characters, ";")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn flags_are_parsed() {
        let reference = parse("VIZ_PDF(|filename=report|mergepdf)");
        assert!(reference.merge_pdf);

        let reference = parse("VIZ_IMAGE(|vizlink)");
        assert!(reference.viz_link);

        let reference = parse("VIZ_LINK(sales/summary|rawlink)");
        assert!(reference.raw_link);
    }

    #[test]
    fn mergepdf_is_ignored_outside_pdf() {
        let reference = parse("VIZ_CSV(|mergepdf)");
        assert!(!reference.merge_pdf);
    }

    #[test]
    fn unknown_arguments_are_ignored() {
        let reference = parse("VIZ_IMAGE(|futureargument=1|filename=ok)");
        assert_eq!(reference.filename.as_deref(), Some("ok.png"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(parse_reference("VIZ_IMAGE", TRIGGER).is_err());
        assert!(parse_reference("VIZ_GIF()", TRIGGER).is_err());
        assert!(parse_reference("IMAGE()", TRIGGER).is_err());
    }
}
