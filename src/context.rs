// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::config::Configuration;
use crate::render::Renderer;
use crate::transport::{EmailTransport, SmsTransport};

/// Inner data shared across the alert pipeline and all task workers.
pub struct Data {
    /// Application configuration.
    pub config: Configuration,

    /// Renderer collaborator turning view locators into local artifacts.
    pub renderer: Arc<dyn Renderer>,

    /// Email transport collaborator.
    pub email: Arc<dyn EmailTransport>,

    /// SMS transport collaborator. Constructed once at startup and injected here; `None` when no
    /// valid client is configured.
    pub sms: Option<Arc<dyn SmsTransport>>,
}

impl Data {
    pub fn new(
        config: Configuration,
        renderer: Arc<dyn Renderer>,
        email: Arc<dyn EmailTransport>,
        sms: Option<Arc<dyn SmsTransport>>,
    ) -> Self {
        Self {
            config,
            renderer,
            email,
            sms,
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .finish()
    }
}

/// Data shared across the alert pipeline and all task workers.
pub struct Context(pub Arc<Data>);

impl Context {
    /// Returns a new instance of `Context`.
    pub fn new(
        config: Configuration,
        renderer: Arc<dyn Renderer>,
        email: Arc<dyn EmailTransport>,
        sms: Option<Arc<dyn SmsTransport>>,
    ) -> Self {
        Self(Arc::new(Data::new(config, renderer, email, sms)))
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Deref for Context {
    type Target = Data;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish()
    }
}
