//! Cluster configuration management
//!
//! The topology description is a declarative file (TOML by default, any format
//! the `config` crate understands by extension) layered with environment
//! overrides of the form `CARBON_CLUSTER__<SECTION>__<KEY>`. It is parsed once by
//! [`ClusterConfiguration::build`] and read-only afterwards.

use crate::error::{ClusterError, Result};
use crate::scheme::MembershipSchemeKind;
use config::{Config, ConfigError, Environment, File, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "CARBON_CLUSTER";

/// Domain used when the topology does not name one
pub const DEFAULT_DOMAIN: &str = "wso2.carbon.domain";

/// Member property that is available to placeholders but never advertised
const HOST_NAME_PROPERTY: &str = "hostName";

/// Declarative cluster topology, built once from its source location
#[derive(Debug, Default)]
pub struct ClusterConfiguration {
    source_location: Option<PathBuf>,
    tree: Option<Config>,
    settings: Option<ClusterSettings>,
}

impl ClusterConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source location and build in one step
    pub fn from_source<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let mut configuration = Self::new();
        configuration.set_configuration_source_location(path);
        configuration.build()?;
        Ok(configuration)
    }

    /// Set where the topology description lives. Nothing is read until `build`.
    pub fn set_configuration_source_location<P: Into<PathBuf>>(&mut self, path: P) {
        self.source_location = Some(path.into());
    }

    pub fn source_location(&self) -> Option<&Path> {
        self.source_location.as_deref()
    }

    /// Parse the source into the property tree and typed settings.
    ///
    /// A configuration can only be built once; a second call is rejected.
    pub fn build(&mut self) -> Result<()> {
        if self.is_built() {
            return Err(ClusterError::configuration(
                "Cluster configuration has already been built",
            ));
        }

        let location = self.source_location.clone().ok_or_else(|| {
            ClusterError::configuration(
                "Could not build cluster configuration: no source location has been set",
            )
        })?;

        let tree = Config::builder()
            .add_source(File::from(location.as_path()).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("wka.members"),
            )
            .build()
            .map_err(|e| build_error(&location, e))?;

        let mut settings: ClusterSettings = tree
            .clone()
            .try_deserialize()
            .map_err(|e| build_error(&location, e))?;
        settings.properties = restore_key_case(
            std::mem::take(&mut settings.properties),
            &declared_property_keys(&location)?,
        );

        settings.validate().map_err(|e| match e {
            ClusterError::Configuration(msg) => build_error(&location, msg),
            other => other,
        })?;

        tracing::debug!(
            "Built cluster configuration from {} (scheme={}, enabled={})",
            location.display(),
            settings.membership_scheme,
            settings.enabled
        );

        self.tree = Some(tree);
        self.settings = Some(settings);
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.settings.is_some()
    }

    /// Typed view of the built configuration
    pub fn settings(&self) -> Result<&ClusterSettings> {
        self.settings.as_ref().ok_or_else(not_built)
    }

    /// First value of a dotted property key, or `None` if absent
    pub fn get_first_property(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .lookup(name)?
            .and_then(|value| match value.clone().into_array() {
                Ok(values) => values.into_iter().next().and_then(|v| v.into_string().ok()),
                Err(_) => value.into_string().ok(),
            }))
    }

    /// All values of a repeatable property key, in declaration order
    pub fn get_properties(&self, name: &str) -> Result<Vec<String>> {
        Ok(match self.lookup(name)? {
            Some(value) => match value.clone().into_array() {
                Ok(values) => values
                    .into_iter()
                    .filter_map(|v| v.into_string().ok())
                    .collect(),
                Err(_) => value.into_string().map(|s| vec![s]).unwrap_or_default(),
            },
            None => Vec::new(),
        })
    }

    /// Whether clustering is enabled and configured with the named scheme
    pub fn should_initialize(&self, scheme_name: &str) -> Result<bool> {
        let settings = self.settings()?;
        Ok(settings.enabled
            && settings
                .membership_scheme
                .trim()
                .eq_ignore_ascii_case(scheme_name.trim()))
    }

    fn lookup(&self, name: &str) -> Result<Option<Value>> {
        let tree = self.tree.as_ref().ok_or_else(not_built)?;
        match tree.get::<Value>(name) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_built() -> ClusterError {
    ClusterError::configuration("Cluster configuration has not been built")
}

fn build_error(location: &Path, err: impl Display) -> ClusterError {
    ClusterError::configuration(format!(
        "Could not build cluster configuration from {}: {}",
        location.display(),
        err
    ))
}

/// Keys of the `[properties]` table as spelled in the source file.
///
/// The property tree folds keys to lowercase; member properties keep the
/// declared spelling. Only TOML and JSON sources are inspected.
fn declared_property_keys(location: &Path) -> Result<Vec<String>> {
    let format = location
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let keys = match format.as_deref() {
        Some("toml") => {
            let text = std::fs::read_to_string(location).map_err(|e| build_error(location, e))?;
            let table: toml::Table = toml::from_str(&text).map_err(|e| build_error(location, e))?;
            table
                .get("properties")
                .and_then(toml::Value::as_table)
                .map(|properties| properties.keys().cloned().collect())
        }
        Some("json") => {
            let text = std::fs::read_to_string(location).map_err(|e| build_error(location, e))?;
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| build_error(location, e))?;
            value
                .get("properties")
                .and_then(serde_json::Value::as_object)
                .map(|properties| properties.keys().cloned().collect())
        }
        _ => None,
    };

    Ok(keys.unwrap_or_default())
}

/// Give folded keys back their declared spelling; undeclared keys (from the
/// environment) stay as they are
fn restore_key_case(
    properties: HashMap<String, String>,
    declared: &[String],
) -> HashMap<String, String> {
    properties
        .into_iter()
        .map(|(key, value)| {
            let key = declared
                .iter()
                .find(|name| name.to_lowercase() == key.to_lowercase())
                .cloned()
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}

/// Typed cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Whether this node takes part in a cluster at all
    pub enabled: bool,

    /// Membership scheme identifier (`multicast` or `wka`)
    pub membership_scheme: String,

    /// Cluster domain; members of other domains are ignored
    pub domain: String,

    /// Retry attempts per target when a delivery hits a transport error
    pub max_retries: u32,

    pub local_member: LocalMemberSettings,

    pub multicast: MulticastSettings,

    pub wka: WkaSettings,

    pub timeouts: TimeoutSettings,

    /// Properties advertised with the local member
    pub properties: HashMap<String, String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            membership_scheme: MembershipSchemeKind::Multicast.as_str().to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            max_retries: 10,
            local_member: LocalMemberSettings::default(),
            multicast: MulticastSettings::default(),
            wka: WkaSettings::default(),
            timeouts: TimeoutSettings::default(),
            properties: HashMap::new(),
        }
    }
}

impl ClusterSettings {
    pub fn scheme_kind(&self) -> Result<MembershipSchemeKind> {
        self.membership_scheme.parse()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        let scheme = self.scheme_kind()?;

        if self.domain.trim().is_empty() {
            return Err(ClusterError::configuration("Cluster domain cannot be empty"));
        }

        self.multicast.group()?;
        self.multicast.interface()?;

        for member in &self.wka.members {
            parse_host_port(member)?;
        }

        if self.enabled && scheme == MembershipSchemeKind::Wka && self.wka.members.is_empty() {
            return Err(ClusterError::configuration(
                "The wka membership scheme requires at least one well-known member",
            ));
        }

        if self.local_member.port_range_size == 0 {
            return Err(ClusterError::configuration(
                "local_member.port_range_size must be greater than zero",
            ));
        }

        self.timeouts.validate()?;

        if self.wka.rejoin_interval_ms == 0 {
            return Err(ClusterError::configuration(
                "wka.rejoin_interval_ms must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Member properties with `${name}` placeholders resolved.
    ///
    /// `hostName` is available to placeholders but is not advertised itself.
    pub fn member_properties(&self, host_name: &str) -> HashMap<String, String> {
        let mut scope = self.properties.clone();
        scope.insert(HOST_NAME_PROPERTY.to_string(), host_name.to_string());

        self.properties
            .iter()
            .filter(|(key, _)| key.as_str() != HOST_NAME_PROPERTY)
            .map(|(key, value)| {
                (
                    resolve_placeholders(key, &scope),
                    resolve_placeholders(value, &scope),
                )
            })
            .collect()
    }
}

/// Local member (receiver) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMemberSettings {
    /// Host advertised to other members; detected when absent
    pub host: Option<String>,

    /// Address the receiver binds to; defaults to `host`
    pub bind_address: Option<String>,

    /// Preferred receiver port; `0` asks the OS for an ephemeral port
    pub port: Option<u16>,

    /// First port tried when the preferred port is unavailable
    pub port_range_start: u16,

    /// Number of ports tried from `port_range_start`
    pub port_range_size: u16,
}

impl Default for LocalMemberSettings {
    fn default() -> Self {
        Self {
            host: None,
            bind_address: None,
            port: None,
            port_range_start: 4000,
            port_range_size: 100,
        }
    }
}

/// Multicast discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastSettings {
    pub address: String,
    pub port: u16,
    pub ttl: u32,
    /// Interface used to join the group
    pub interface: Option<String>,
    /// Receive datagrams sent from this host
    pub loopback: bool,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            address: "228.0.0.4".to_string(),
            port: 45564,
            ttl: 1,
            interface: None,
            loopback: true,
        }
    }
}

impl MulticastSettings {
    pub fn group(&self) -> Result<Ipv4Addr> {
        let group: Ipv4Addr = self.address.trim().parse().map_err(|e| {
            ClusterError::configuration(format!(
                "Invalid multicast address '{}': {}",
                self.address, e
            ))
        })?;
        if !group.is_multicast() {
            return Err(ClusterError::configuration(format!(
                "{} is not a multicast address",
                group
            )));
        }
        Ok(group)
    }

    pub fn interface(&self) -> Result<Ipv4Addr> {
        match self.interface.as_deref() {
            Some(interface) => interface.trim().parse().map_err(|e| {
                ClusterError::configuration(format!(
                    "Invalid multicast interface '{}': {}",
                    interface, e
                ))
            }),
            None => Ok(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Well-known-address discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WkaSettings {
    /// Seed members as `host:port`
    pub members: Vec<String>,

    /// How often seeds that are not current members are contacted again
    pub rejoin_interval_ms: u64,
}

impl Default for WkaSettings {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            rejoin_interval_ms: 5000,
        }
    }
}

impl WkaSettings {
    pub fn rejoin_interval(&self) -> Duration {
        Duration::from_millis(self.rejoin_interval_ms)
    }
}

/// Timeouts, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub init_ms: u64,
    pub connect_ms: u64,
    pub send_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 3000,
            init_ms: 30_000,
            connect_ms: 500,
            send_ms: 10_000,
        }
    }
}

impl TimeoutSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    fn validate(&self) -> Result<()> {
        let named = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("init_ms", self.init_ms),
            ("connect_ms", self.connect_ms),
            ("send_ms", self.send_ms),
        ];
        for (name, value) in named {
            if value == 0 {
                return Err(ClusterError::configuration(format!(
                    "timeouts.{} must be greater than zero",
                    name
                )));
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ClusterError::configuration(
                "timeouts.heartbeat_timeout_ms must be greater than timeouts.heartbeat_interval_ms",
            ));
        }

        Ok(())
    }
}

/// Split a `host:port` well-known member entry
pub fn parse_host_port(entry: &str) -> Result<(String, u16)> {
    let invalid = || {
        ClusterError::configuration(format!(
            "Invalid well-known member '{}': expected host:port",
            entry
        ))
    };

    let (host, port) = entry.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Replace `${name}` placeholders from `properties`, falling back to the
/// process environment. Unknown placeholders are left untouched.
pub fn resolve_placeholders(text: &str, properties: &HashMap<String, String>) -> String {
    let mut resolved = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];

        resolved.push_str(&rest[..start]);
        match properties
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
        {
            Some(value) => resolved.push_str(&value),
            None => resolved.push_str(&rest[start..start + end + 3]),
        }
        rest = &after[end + 1..];
    }

    resolved.push_str(rest);
    resolved
}
