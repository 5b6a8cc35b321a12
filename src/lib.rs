// SPDX-License-Identifier: AGPL-3.0-or-later

//! # vizalerts
//!
//! Evaluates data-driven alerts: a trigger view is exported as row-oriented
//! data, text fields are scanned for embedded content references (inline
//! images, attached PDFs/CSVs, hyperlinks), each distinct reference is
//! rendered exactly once, rows are consolidated into outgoing messages and
//! every message is dispatched as an independently-executed task.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

mod alert;
mod config;
mod context;
mod dispatch;
mod errors;
mod reference;
mod render;
mod transport;
mod trigger;

pub use crate::alert::{
    dedup_and_sort, ActionKind, Alert, AlertFailure, AlertRunner, AlertType, Capabilities,
    FieldKey, FieldMap, RowGroup,
};
pub use crate::config::Configuration;
pub use crate::context::Context;
pub use crate::dispatch::{Task, TaskKind, TaskPayload, TaskQueue, TaskStatus, TaskStatusChange};
pub use crate::errors::{AlertError, ReferenceError, RenderError, RowError};
pub use crate::reference::{
    extract_and_resolve, parse_reference, ContentReference, ReferenceKind, ReferenceRegistry,
    ScanField, ScanShape,
};
pub use crate::render::{render_with_retry, RenderFormat, Renderer};
pub use crate::transport::{
    Attachment, EmailPayload, EmailTransport, SmsPayload, SmsTransport,
};
pub use crate::trigger::{Row, RowSet};
