// SPDX-License-Identifier: AGPL-3.0-or-later

//! Renderer collaborator boundary.
//!
//! The engine never renders views itself: it hands a view locator and a target format to an
//! external renderer and receives the path of a locally stored artifact back. Rendering is the
//! only network-facing call issued before tasks are enqueued, so the bounded retry budget for
//! transient failures lives here.

use std::path::PathBuf;

use log::warn;

use crate::errors::RenderError;

/// Output format of a rendered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderFormat {
    Png,
    Pdf,
    Csv,
    Twb,
}

impl RenderFormat {
    /// Lowercase file extension for artifacts of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Twb => "twb",
        }
    }
}

impl std::fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Png => "PNG",
            Self::Pdf => "PDF",
            Self::Csv => "CSV",
            Self::Twb => "TWB",
        };
        write!(f, "{}", tag)
    }
}

/// Renders a view locator into a locally stored artifact.
///
/// Implementations own authentication, timeouts and the transient-failure handling of a single
/// attempt; the caller decides how many attempts to spend via [`render_with_retry`].
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, locator: &str, format: RenderFormat) -> anyhow::Result<PathBuf>;
}

/// Calls the renderer up to `tries` times, returning the first successful artifact path.
///
/// Every failed attempt is logged; when the budget is spent the last error is surfaced in a
/// descriptive [`RenderError`], which is fatal to the alert that requested the render.
pub async fn render_with_retry(
    renderer: &dyn Renderer,
    locator: &str,
    format: RenderFormat,
    tries: u32,
) -> Result<PathBuf, RenderError> {
    let tries = tries.max(1);
    let mut last_message = String::new();

    for attempt in 1..=tries {
        match renderer.render(locator, format).await {
            Ok(path) => return Ok(path),
            Err(err) => {
                warn!(
                    "Render attempt {}/{} for {} as {} failed: {}",
                    attempt, tries, locator, format, err
                );
                last_message = err.to_string();
            }
        }
    }

    Err(RenderError {
        reference: locator.to_string(),
        tries,
        message: last_message,
    })
}
