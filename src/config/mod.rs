//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::{
    feed::{DEFAULT_INACTIVITY, FeedOptions},
    site::SiteSettings,
};
use crate::domain::{DeletedPolicy, RenderFailurePolicy};
use crate::infra::store::{Credentials, DEFAULT_MAX_ATTEMPTS};

pub use cli::{BuildArgs, CliArgs, Command, CommonOverrides, SiteArgs, SiteOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "staticplus";
const DEFAULT_NAMESPACE: &str = "SP";
const DEFAULT_STAGING: &str = "SP-staging";
const DEFAULT_PRODUCTION: &str = "SP-production";
const DEFAULT_PRODUCTION_PREFIX: &str = "www.";
const DEFAULT_STAGING_PREFIX: &str = "staging.";
const DEFAULT_TEMPLATE: &str = "page";
const DEFAULT_CYCLE_MS: u64 = 500;
const DEFAULT_FEED_LIMIT: u64 = 200;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub site: SiteDefaults,
    pub feed: FeedSettings,
    pub build: BuildSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub credentials: Option<Credentials>,
}

/// Site layout shared by every `site` run.
#[derive(Debug, Clone)]
pub struct SiteDefaults {
    pub namespace: String,
    pub staging: String,
    pub production: String,
    pub production_prefix: String,
    pub staging_prefix: String,
    pub bounce_prefix: Option<String>,
    pub template: String,
    pub cycle: Duration,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub inactivity: Duration,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub max_attempts: NonZeroU32,
    pub render_failure: RenderFailurePolicy,
    pub deleted: DeletedPolicy,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

impl Settings {
    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            limit: self.feed.limit,
            inactivity: self.feed.inactivity,
            ..FeedOptions::default()
        }
    }

    /// Site settings for one server, database and hostname.
    pub fn site(&self, server: Url, database: &str, hostname: &str) -> SiteSettings {
        let defaults = &self.site;
        let mut site = SiteSettings::new(server, database, hostname);
        site.namespace = defaults.namespace.clone();
        site.staging = defaults.staging.clone();
        site.production = defaults.production.clone();
        site.production_prefix = defaults.production_prefix.clone();
        site.staging_prefix = defaults.staging_prefix.clone();
        site.bounce_prefix = defaults.bounce_prefix.clone();
        site.template = defaults.template.clone();
        site.push_cycle = defaults.cycle;
        site.read_only = defaults.read_only;
        site.max_attempts = self.build.max_attempts;
        site.render_failure = self.build.render_failure;
        site.deleted = self.build.deleted;
        site.feed = self.feed_options();
        site
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STATICPLUS").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_common_overrides(cli.command.common());
    if let Command::Site(args) = &cli.command {
        raw.apply_site_overrides(&args.overrides);
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    site: RawSiteSettings,
    feed: RawFeedSettings,
    build: RawBuildSettings,
}

impl RawSettings {
    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(creds) = overrides.creds.as_ref() {
            self.store.creds = Some(creds.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_site_overrides(&mut self, overrides: &SiteOverrides) {
        if let Some(prefix) = overrides.production_prefix.as_ref() {
            self.site.production_prefix = Some(prefix.clone());
        }
        if let Some(prefix) = overrides.staging_prefix.as_ref() {
            self.site.staging_prefix = Some(prefix.clone());
        }
        if let Some(prefix) = overrides.bounce_prefix.as_ref() {
            self.site.bounce_prefix = Some(prefix.clone());
        }
        if let Some(cycle) = overrides.cycle_ms {
            self.site.cycle_ms = Some(cycle);
        }
        if let Some(read_only) = overrides.read_only {
            self.site.read_only = Some(read_only);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            site,
            feed,
            build,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            site: build_site_settings(site)?,
            feed: build_feed_settings(feed)?,
            build: build_build_settings(build)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let credentials = non_empty(store.creds)
        .map(|value| Credentials::from_str(&value))
        .transpose()
        .map_err(|reason| LoadError::invalid("store.creds", reason))?;
    Ok(StoreSettings { credentials })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteDefaults, LoadError> {
    let namespace = non_empty(site.namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    if namespace.contains('/') {
        return Err(LoadError::invalid(
            "site.namespace",
            "must not contain `/`",
        ));
    }
    let staging = non_empty(site.staging).unwrap_or_else(|| DEFAULT_STAGING.to_string());
    let production = non_empty(site.production).unwrap_or_else(|| DEFAULT_PRODUCTION.to_string());
    if staging == production {
        return Err(LoadError::invalid(
            "site.production",
            "staging and production design documents must differ",
        ));
    }

    let cycle_ms = site.cycle_ms.unwrap_or(DEFAULT_CYCLE_MS);

    Ok(SiteDefaults {
        namespace,
        staging,
        production,
        production_prefix: site
            .production_prefix
            .unwrap_or_else(|| DEFAULT_PRODUCTION_PREFIX.to_string()),
        staging_prefix: site
            .staging_prefix
            .unwrap_or_else(|| DEFAULT_STAGING_PREFIX.to_string()),
        bounce_prefix: non_empty(site.bounce_prefix),
        template: non_empty(site.template).unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        cycle: Duration::from_millis(cycle_ms),
        read_only: site.read_only.unwrap_or(false),
    })
}

fn build_feed_settings(feed: RawFeedSettings) -> Result<FeedSettings, LoadError> {
    let inactivity = match feed.inactivity_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "feed.inactivity_ms",
                "must be greater than zero",
            ));
        }
        Some(ms) => Duration::from_millis(ms),
        None => DEFAULT_INACTIVITY,
    };
    // Zero turns paging off.
    let limit = match feed.limit {
        Some(0) => None,
        Some(limit) => Some(limit),
        None => Some(DEFAULT_FEED_LIMIT),
    };
    Ok(FeedSettings { inactivity, limit })
}

fn build_build_settings(build: RawBuildSettings) -> Result<BuildSettings, LoadError> {
    let max_attempts = match build.max_attempts {
        Some(value) => non_zero_u32(value, "build.max_attempts")?,
        None => DEFAULT_MAX_ATTEMPTS,
    };
    let render_failure = parse_policy(build.render_failure, "build.render_failure")?;
    let deleted = parse_policy(build.deleted, "build.deleted")?;
    Ok(BuildSettings {
        max_attempts,
        render_failure,
        deleted,
    })
}

fn parse_policy<P>(value: Option<String>, key: &'static str) -> Result<P, LoadError>
where
    P: FromStr + Default,
    P::Err: std::fmt::Display,
{
    match non_empty(value) {
        Some(value) => P::from_str(&value).map_err(|err| LoadError::invalid(key, err.to_string())),
        None => Ok(P::default()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    creds: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    namespace: Option<String>,
    staging: Option<String>,
    production: Option<String>,
    production_prefix: Option<String>,
    staging_prefix: Option<String>,
    bounce_prefix: Option<String>,
    template: Option<String>,
    cycle_ms: Option<u64>,
    read_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFeedSettings {
    inactivity_ms: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBuildSettings {
    max_attempts: Option<u64>,
    render_failure: Option<String>,
    deleted: Option<String>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
