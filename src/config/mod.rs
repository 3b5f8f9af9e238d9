//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    num::NonZeroU64,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{AuthRequirement, CacheConfig, KeyFacet, SpillMedium};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "httpcache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ROOT: &str = ".";
const DEFAULT_BODY_LIMIT_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_STORE_NAME: &str = "MEM";
const DEFAULT_STORE_MAX_WEIGHT_BYTES: u64 = 64 * 1024 * 1024;

/// Command-line arguments for the httpcache binary.
#[derive(Debug, Parser)]
#[command(name = "httpcache", version, about = "Caching HTTP file server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HTTPCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve a directory through the response cache.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Directory whose files are served.
    #[arg(long = "root", value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub root: Option<PathBuf>,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the largest response body the cache buffers, in bytes.
    #[arg(long = "body-limit-bytes", value_name = "BYTES")]
    pub body_limit_bytes: Option<u64>,

    /// Trust this request header as the authenticated user id.
    #[arg(long = "remote-user-header", value_name = "HEADER")]
    pub remote_user_header: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub stores: Vec<StoreSettings>,
    pub configs: Vec<CacheConfig>,
    pub rules: Vec<RuleSettings>,
    pub identity: IdentitySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub root: PathBuf,
    pub body_limit_bytes: usize,
    pub remote_user_header: Option<String>,
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

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub name: String,
    pub max_weight_bytes: NonZeroU64,
    /// `None` keeps entries until evicted or invalidated.
    pub default_ttl: Option<Duration>,
    pub spill: SpillMedium,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSettings {
    CacheOnlyGetRequest,
    CacheOnlyResponse200,
    HonorCacheControlHeaders,
    MarkResponseAsCacheDelivered,
    StripResponseHeaders { headers: Vec<String> },
}

impl RuleSettings {
    /// Rule chain used when no `rules` are configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::CacheOnlyGetRequest,
            Self::CacheOnlyResponse200,
            Self::HonorCacheControlHeaders,
            Self::StripResponseHeaders {
                headers: vec!["Set-Cookie".to_string()],
            },
            Self::MarkResponseAsCacheDelivered,
        ]
    }
}

/// Static user → groups directory.
#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
    pub users: BTreeMap<String, Vec<String>>,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("HTTPCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    stores: Option<Vec<RawStoreSettings>>,
    configs: Vec<RawCacheConfig>,
    rules: Option<Vec<RawRuleSettings>>,
    identity: RawIdentitySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(root) = overrides.root.as_ref() {
            self.server.root = Some(root.clone());
        }
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(limit) = overrides.body_limit_bytes {
            self.server.body_limit_bytes = Some(limit);
        }
        if let Some(header) = overrides.remote_user_header.as_ref() {
            self.server.remote_user_header = Some(header.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            stores,
            configs,
            rules,
            identity,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let stores = build_store_settings(stores)?;
        let configs = build_cache_configs(configs)?;
        let rules = build_rule_settings(rules)?;
        let identity = IdentitySettings {
            users: identity.users,
        };

        Ok(Self {
            server,
            logging,
            stores,
            configs,
            rules,
            identity,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let root = server.root.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("server.root", "path must not be empty"));
    }

    let body_limit = server.body_limit_bytes.unwrap_or(DEFAULT_BODY_LIMIT_BYTES);
    if body_limit == 0 {
        return Err(LoadError::invalid(
            "server.body_limit_bytes",
            "must be greater than zero",
        ));
    }
    let body_limit_bytes = usize::try_from(body_limit).map_err(|_| {
        LoadError::invalid(
            "server.body_limit_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let remote_user_header = server.remote_user_header.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(ServerSettings {
        addr,
        root,
        body_limit_bytes,
        remote_user_header,
    })
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

fn build_store_settings(
    stores: Option<Vec<RawStoreSettings>>,
) -> Result<Vec<StoreSettings>, LoadError> {
    let Some(stores) = stores else {
        return Ok(vec![StoreSettings {
            name: DEFAULT_STORE_NAME.to_string(),
            max_weight_bytes: NonZeroU64::new(DEFAULT_STORE_MAX_WEIGHT_BYTES)
                .ok_or_else(|| LoadError::invalid("stores", "default weight is zero"))?,
            default_ttl: None,
            spill: SpillMedium::Memory,
        }]);
    };

    let mut seen = BTreeSet::new();
    stores
        .into_iter()
        .map(|store| {
            let name = store.name.trim().to_string();
            if name.is_empty() {
                return Err(LoadError::invalid("stores.name", "name must not be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(LoadError::invalid(
                    "stores.name",
                    format!("store `{name}` is declared twice"),
                ));
            }

            let max_weight_bytes = NonZeroU64::new(
                store
                    .max_weight_bytes
                    .unwrap_or(DEFAULT_STORE_MAX_WEIGHT_BYTES),
            )
            .ok_or_else(|| {
                LoadError::invalid(
                    "stores.max_weight_bytes",
                    format!("store `{name}`: must be greater than zero"),
                )
            })?;

            let default_ttl = store
                .default_ttl_seconds
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs);

            let spill = match store.spill.as_deref().map(str::trim) {
                None | Some("memory") => SpillMedium::Memory,
                Some("file") => SpillMedium::File(
                    store
                        .spill_dir
                        .unwrap_or_else(|| std::env::temp_dir().join("httpcache")),
                ),
                Some(other) => {
                    return Err(LoadError::invalid(
                        "stores.spill",
                        format!("store `{name}`: unknown spill medium `{other}`"),
                    ));
                }
            };

            Ok(StoreSettings {
                name,
                max_weight_bytes,
                default_ttl,
                spill,
            })
        })
        .collect()
}

fn build_cache_configs(configs: Vec<RawCacheConfig>) -> Result<Vec<CacheConfig>, LoadError> {
    let mut seen = BTreeSet::new();
    configs
        .into_iter()
        .map(|raw| {
            let name = raw.name.clone().unwrap_or_default();
            if !name.is_empty() && !seen.insert(name.clone()) {
                return Err(LoadError::invalid(
                    "configs.name",
                    format!("config `{name}` is declared twice"),
                ));
            }
            raw.into_config()
                .map_err(|err| LoadError::invalid("configs", err.to_string()))
        })
        .collect()
}

fn build_rule_settings(
    rules: Option<Vec<RawRuleSettings>>,
) -> Result<Vec<RuleSettings>, LoadError> {
    let Some(rules) = rules else {
        return Ok(RuleSettings::defaults());
    };

    rules
        .into_iter()
        .map(|rule| match rule.kind.trim() {
            "cache_only_get_request" => Ok(RuleSettings::CacheOnlyGetRequest),
            "cache_only_response_200" => Ok(RuleSettings::CacheOnlyResponse200),
            "honor_cache_control_headers" => Ok(RuleSettings::HonorCacheControlHeaders),
            "mark_response_as_cache_delivered" => Ok(RuleSettings::MarkResponseAsCacheDelivered),
            "strip_response_headers" => {
                let headers = rule
                    .headers
                    .unwrap_or_else(|| vec!["Set-Cookie".to_string()]);
                if headers.iter().any(|header| header.trim().is_empty()) {
                    return Err(LoadError::invalid(
                        "rules.headers",
                        "header names must not be empty",
                    ));
                }
                Ok(RuleSettings::StripResponseHeaders { headers })
            }
            other => Err(LoadError::invalid(
                "rules.kind",
                format!("unknown handling rule `{other}`"),
            )),
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    root: Option<PathBuf>,
    body_limit_bytes: Option<u64>,
    remote_user_header: Option<String>,
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
    name: String,
    max_weight_bytes: Option<u64>,
    default_ttl_seconds: Option<u64>,
    spill: Option<String>,
    spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheConfig {
    name: Option<String>,
    store: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    invalidate_on: Vec<String>,
    response_mime_type: Option<String>,
    auth: Option<AuthRequirement>,
    mandatory_groups: Vec<String>,
    optional_groups: Vec<String>,
    facets: Vec<KeyFacet>,
    expiry_on_create_seconds: Option<u64>,
    expiry_on_update_seconds: Option<u64>,
    expiry_on_access_seconds: Option<u64>,
    attributes: BTreeMap<String, String>,
}

impl RawCacheConfig {
    fn into_config(self) -> Result<CacheConfig, crate::cache::CacheError> {
        let mut builder = CacheConfig::builder(
            self.name.unwrap_or_default(),
            self.store.unwrap_or_else(|| DEFAULT_STORE_NAME.to_string()),
        )
        .auth(self.auth.unwrap_or_default());

        for pattern in self.include {
            builder = builder.include(pattern);
        }
        for pattern in self.exclude {
            builder = builder.exclude(pattern);
        }
        for pattern in self.invalidate_on {
            builder = builder.invalidate_on(pattern);
        }
        if let Some(mime) = self.response_mime_type {
            builder = builder.response_mime_type(mime);
        }
        for group in self.mandatory_groups {
            builder = builder.mandatory_group(group);
        }
        for group in self.optional_groups {
            builder = builder.optional_group(group);
        }
        for facet in self.facets {
            builder = builder.facet(facet);
        }
        if let Some(seconds) = self.expiry_on_create_seconds {
            builder = builder.expiry_on_create(Duration::from_secs(seconds));
        }
        if let Some(seconds) = self.expiry_on_update_seconds {
            builder = builder.expiry_on_update(Duration::from_secs(seconds));
        }
        if let Some(seconds) = self.expiry_on_access_seconds {
            builder = builder.expiry_on_access(Duration::from_secs(seconds));
        }
        for (name, value) in self.attributes {
            builder = builder.attribute(name, value);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRuleSettings {
    kind: String,
    headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdentitySettings {
    users: BTreeMap<String, Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
