//! Access Layer Builder
//!
//! Assembles an [`AccessLayer`] from configuration plus either a ready-made
//! [`HttpTransport`] or a [`TokenProvider`] for the default `reqwest` one.
//!
//! # Example: Production Transport
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spotify_access_layer::{AccessLayerBuilder, StaticToken};
//!
//! # fn main() -> anyhow::Result<()> {
//! let layer = AccessLayerBuilder::new()
//!     .with_token_provider(Arc::new(StaticToken("BQD...".to_string())))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Custom Transport
//!
//! ```rust,ignore
//! let layer = AccessLayerBuilder::new()
//!     .with_config(config)
//!     .with_transport(Arc::new(MyRecordedTransport::new()))
//!     .build()?;
//! ```

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use crate::AccessLayer;
use crate::config::AccessLayerConfig;
use crate::traits::{HttpTransport, TokenProvider};
use crate::transport::ReqwestTransport;

/// Builder for [`AccessLayer`]
#[derive(Default)]
pub struct AccessLayerBuilder {
    config: Option<AccessLayerConfig>,
    transport: Option<Arc<dyn HttpTransport>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl AccessLayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of [`AccessLayerConfig::default`]
    #[must_use]
    pub fn with_config(mut self, config: AccessLayerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom transport; takes precedence over a token provider
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Token source for the default `reqwest` transport
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Validate the configuration and wire every component
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, if neither a
    /// transport nor a token provider was supplied, or if the HTTP client
    /// cannot be built.
    pub fn build(self) -> Result<AccessLayer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport: Arc<dyn HttpTransport> = match (self.transport, self.token_provider) {
            (Some(transport), _) => {
                info!(transport = transport.name(), "Using custom transport");
                transport
            }
            (None, Some(tokens)) => Arc::new(ReqwestTransport::new(&config.upstream, tokens)?),
            (None, None) => bail!("an HTTP transport or a token provider is required"),
        };

        Ok(AccessLayer::from_parts(config, transport))
    }
}
