// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

/// Errors found while parsing a content reference token.
///
/// These are structural errors: the alert that carries the reference is aborted immediately,
/// nothing is retried or skipped.
#[derive(thiserror::Error, Debug)]
pub enum ReferenceError {
    /// The token does not match the `VIZ_*(..)` shape at all.
    #[error("malformed content reference: {0}")]
    Malformed(String),

    /// A custom filename contained a non-allowed path separator.
    #[error("found an invalid or non-allowed separator in filename {filename} for content reference {reference}")]
    FilenameSeparator { filename: String, reference: String },

    /// A custom filename was absolute or tried to traverse upwards.
    #[error("found non-allowed path when expecting filename: {filename} for content reference {reference}")]
    FilenamePath { filename: String, reference: String },

    /// A custom filename contained characters outside the allowed set.
    #[error(
        "found non-allowed character(s) {characters:?} in filename {filename} for content \
         reference {reference}, only allowed characters are alphanumeric, space, hyphen, \
         underscore, period, and plus sign"
    )]
    FilenameCharacters {
        characters: String,
        filename: String,
        reference: String,
    },

    /// An export file path argument was absolute or tried to traverse upwards.
    #[error("found an invalid or non-allowed export file path: {path} for content reference {reference}")]
    ExportPath { path: String, reference: String },
}

/// Error returned when rendering a content reference failed even after the configured retry
/// budget was spent.
#[derive(thiserror::Error, Debug)]
#[error("unable to render content reference {reference} after {tries} tries: {message}")]
pub struct RenderError {
    /// The reference string (or locator) which could not be rendered.
    pub reference: String,

    /// Number of attempts made.
    pub tries: u32,

    /// Message of the last underlying failure.
    pub message: String,
}

/// One row-scoped validation problem, collected (not raised) so the full set can be reported to
/// the alert author at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// 1-based row number in the trigger data file, counting the header as row 1.
    pub row: usize,

    /// User-facing field name the problem belongs to.
    pub field: String,

    /// The offending value.
    pub value: String,

    /// Description of the problem.
    pub error: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}, field {}, value {}: {}",
            self.row, self.field, self.value, self.error
        )
    }
}

/// Represents all the ways evaluating an alert can fail.
#[derive(thiserror::Error, Debug)]
pub enum AlertError {
    /// A content reference could not be parsed.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// A content reference could not be rendered.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// A reference token is present in message text but its registry entry carries no artifact.
    /// This indicates a URL-encoding or extraction bug upstream and must not silently produce
    /// broken output.
    #[error(
        "unable to locate downloaded artifact for {0}, check whether the content reference is \
         properly URL encoded"
    )]
    MissingArtifact(String),

    /// A recipient field turned out unusable at assembly time, after validation had passed.
    #[error("invalid recipient: {0}")]
    Recipient(String),

    /// Merging rendered PDF attachments failed.
    #[error("could not generate merged PDF for filename {filename}: {message}")]
    PdfMerge { filename: String, message: String },

    /// The trigger data exceeded the configured row cap.
    #[error("maximum rows of {max} exceeded")]
    TooManyRows { max: usize },

    /// The trigger data export could not be read.
    #[error("error reading trigger data: {0}")]
    TriggerData(#[from] csv::Error),

    /// Filesystem error while handling trigger data or artifacts.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
