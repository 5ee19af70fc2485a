//! Server configuration.
//!
//! Configuration is layered, lowest priority first:
//! - Built-in defaults (an empty configuration is valid)
//! - TOML configuration file
//! - Environment variables (`CONVOY__PORT`, `CONVOY__TRACKING__SPEED_CEILING_KMH`, ...)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use convoy_core::{
    CacheConfig, ConvoyConfig, GpsSanitizer, HubConfig, MemberIdentity, MemberRole,
    MemoryDirectory,
};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// GPS plausibility and update pacing.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Snapshot cache lifetimes.
    #[serde(default)]
    pub cache: CacheSection,

    /// Authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Static users and groups for development deployments.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Broadcast buffer per journey room.
    #[serde(default = "default_room_capacity")]
    pub room_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Presence timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Fastest plausible speed in km/h.
    #[serde(default = "default_speed_ceiling")]
    pub speed_ceiling_kmh: f64,

    /// Client/server distance divergence that gets logged.
    #[serde(default = "default_tolerance_ratio")]
    pub tolerance_ratio: f64,

    /// Minimum spacing between accepted fixes of one instance, in milliseconds.
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_journey_ttl")]
    pub journey_ttl_secs: u64,

    #[serde(default = "default_member_ttl")]
    pub member_ttl_secs: u64,
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Membership lookups slower than this fail closed.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

/// Static directory contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

/// A user known to the static directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Bearer token accepted for this user.
    #[serde(default)]
    pub token: Option<String>,
}

/// A group and its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_room_capacity() -> usize {
    convoy_core::room::DEFAULT_ROOM_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_speed_ceiling() -> f64 {
    convoy_core::gps::DEFAULT_SPEED_CEILING_KMH
}

fn default_tolerance_ratio() -> f64 {
    convoy_core::gps::DEFAULT_TOLERANCE_RATIO
}

fn default_update_interval() -> u64 {
    2_000
}

fn default_journey_ttl() -> u64 {
    30
}

fn default_member_ttl() -> u64 {
    10
}

fn default_auth_timeout() -> u64 {
    3_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            tracking: TrackingConfig::default(),
            cache: CacheSection::default(),
            auth: AuthConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            room_capacity: default_room_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            speed_ceiling_kmh: default_speed_ceiling(),
            tolerance_ratio: default_tolerance_ratio(),
            update_interval_ms: default_update_interval(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            journey_ttl_secs: default_journey_ttl(),
            member_ttl_secs: default_member_ttl(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_auth_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered under
    /// `CONVOY__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "convoy.toml",
            "/etc/convoy/convoy.toml",
            "~/.config/convoy/convoy.toml",
        ];

        let mut builder = config::Config::builder();
        if let Some(path) = config_paths
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists())
        {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("CONVOY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Names the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if !(self.tracking.speed_ceiling_kmh.is_finite() && self.tracking.speed_ceiling_kmh > 0.0) {
            bail!("tracking.speed_ceiling_kmh must be positive");
        }
        if !(self.tracking.tolerance_ratio.is_finite() && self.tracking.tolerance_ratio >= 0.0) {
            bail!("tracking.tolerance_ratio must not be negative");
        }
        if self.heartbeat.timeout_ms < self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must be at least heartbeat.interval_ms");
        }
        for group in &self.directory.groups {
            if group.owner.is_empty() {
                bail!("directory group {} has no owner", group.id);
            }
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.timeout_ms)
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> ConvoyConfig {
        ConvoyConfig {
            sanitizer: GpsSanitizer::new(
                self.tracking.speed_ceiling_kmh,
                self.tracking.tolerance_ratio,
            ),
            auth_timeout: self.auth_timeout(),
            cache: CacheConfig {
                journey_ttl: Duration::from_secs(self.cache.journey_ttl_secs),
                member_ttl: Duration::from_secs(self.cache.member_ttl_secs),
            },
            hub: HubConfig {
                room_capacity: self.limits.room_capacity,
                update_interval: Duration::from_millis(self.tracking.update_interval_ms),
                auto_delete_empty_rooms: true,
            },
            completion_feed: None,
        }
    }

    /// Build the static directory.
    #[must_use]
    pub fn build_directory(&self) -> MemoryDirectory {
        let directory = MemoryDirectory::new();

        for user in &self.directory.users {
            let mut identity = MemberIdentity::new(&user.id, &user.name);
            if let Some(avatar) = &user.avatar {
                identity = identity.with_avatar(avatar);
            }
            directory.add_user(identity);
            if let Some(token) = &user.token {
                directory.add_token(token, &user.id);
            }
        }

        for group in &self.directory.groups {
            for member in &group.members {
                directory.add_member(&group.id, member, MemberRole::Member);
            }
            for admin in &group.admins {
                directory.add_member(&group.id, admin, MemberRole::Admin);
            }
            directory.add_member(&group.id, &group.owner, MemberRole::Owner);
        }

        directory
    }
}
