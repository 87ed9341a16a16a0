//! Configuration surface for the events subsystem.

use std::sync::Arc;

use config::{Environment, File};
use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::Deserialize;
use url::Url;

use crate::errors::{Error, ErrorKind, Result};
use crate::uploader::Uploader;

lazy_static! {
    static ref DEBUG_VIEW_TAG_RE: Regex = Regex::new(r"^[a-zA-Z0-9-]{1,20}$").unwrap();
}

/// Debug-only options, validated independently from the rest of the
/// configuration so a bad runtime update can be rejected without disturbing
/// prior state (§4.4).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugOptions {
    #[serde(default)]
    pub log_pings: bool,
    #[serde(default)]
    pub debug_view_tag: Option<String>,
    #[serde(default)]
    pub source_tags: Vec<String>,
}

impl DebugOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(tag) = &self.debug_view_tag {
            if !DEBUG_VIEW_TAG_RE.is_match(tag) {
                return Err(ErrorKind::InvalidDebugViewTag(tag.clone()).into());
            }
        }
        if !self.source_tags.is_empty() {
            if self.source_tags.len() > 5 {
                return Err(ErrorKind::InvalidSourceTags(format!(
                    "expected 1-5 source tags, got {}",
                    self.source_tags.len()
                ))
                .into());
            }
            for tag in &self.source_tags {
                if tag.starts_with("glean") || !DEBUG_VIEW_TAG_RE.is_match(tag) {
                    return Err(ErrorKind::InvalidSourceTags(tag.clone()).into());
                }
            }
        }
        Ok(())
    }
}

/// Plain, serde-deserializable settings, deliberately separate from
/// [`Configuration`] so it can come from a file/env layer via
/// [`Configuration::load_layered`] before the uploader (not serializable) is
/// attached.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_endpoint: String,
    #[serde(default = "default_max_events")]
    pub max_events: u32,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub app_build: Option<String>,
    #[serde(default)]
    pub app_display_version: Option<String>,
    #[serde(default)]
    pub build_date: Option<String>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_upload_enabled")]
    pub upload_enabled: bool,
    #[serde(default)]
    pub debug: DebugOptions,
}

fn default_upload_enabled() -> bool {
    true
}

fn default_max_events() -> u32 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_endpoint: "https://incoming.telemetry.example.com".to_owned(),
            max_events: default_max_events(),
            channel: None,
            app_build: None,
            app_display_version: None,
            build_date: None,
            test_mode: false,
            upload_enabled: default_upload_enabled(),
            debug: DebugOptions::default(),
        }
    }
}

/// The events-relevant configuration surface (§4.4), plus the uploader
/// collaborator host applications inject directly.
#[derive(Clone)]
pub struct Configuration {
    pub settings: Settings,
    pub uploader: Arc<dyn Uploader>,
}

impl Configuration {
    /// Build and validate a `Configuration` from already-constructed parts.
    /// This is the common construction path; most host applications never
    /// touch [`Configuration::load_layered`].
    pub fn new(settings: Settings, uploader: Arc<dyn Uploader>) -> Result<Self> {
        let config = Self { settings, uploader };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.settings.server_endpoint)
            .map_err(|_| ErrorKind::InvalidEndpoint(self.settings.server_endpoint.clone()))?;
        if url.scheme() != "https" && !self.settings.test_mode {
            return Err(ErrorKind::InsecureEndpoint(self.settings.server_endpoint.clone()).into());
        }
        if self.settings.max_events < 1 {
            return Err(ErrorKind::General(
                "max_events must be at least 1".to_owned(),
            )
            .into());
        }
        self.settings.debug.validate()?;
        Ok(())
    }

    /// Load [`Settings`] from an optional config file merged with
    /// `GLEAN_EVENTS__`-prefixed environment variables, then attach
    /// `uploader` and validate the result.
    ///
    /// Mirrors the host SDK's own layered settings loader: file first,
    /// environment second, so a deployment can override individual fields
    /// without redeploying the file.
    pub fn load_layered(config_file: Option<&str>, uploader: Arc<dyn Uploader>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server_endpoint", Settings::default().server_endpoint)?
            .set_default("max_events", i64::from(default_max_events()))?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("GLEAN_EVENTS").separator("__"));

        let settings: Settings = builder.build().and_then(|c| c.try_deserialize()).map_err(|e| {
            log::error!("failed to load layered configuration: {e}; check GLEAN_EVENTS__* env vars and the config file path");
            Error::from(e)
        })?;

        Self::new(settings, uploader)
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("settings", &self.settings)
            .finish()
    }
}
