// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content references: inline `VIZ_*(..)` tokens embedded in trigger text which name additional
//! renderings to embed, attach or link.

mod parser;
mod registry;

pub use parser::{parse_reference, ContentReference, ReferenceKind};
pub use registry::{extract_and_resolve, ReferenceRegistry, ScanField, ScanShape};
