//! Configuration Entries
//!
//! A single daemon option as a key/value pair. The same entry renders
//! either as launch arguments (`--Key value`) or as a fragment of a live
//! `SETCONF` command (`Key="value"`), so the two paths can never drift.

use std::fmt;

/// Option keys this crate produces.
pub mod keys {
    pub const CLIENT_ONLY: &str = "ClientOnly";
    pub const AVOID_DISK_WRITES: &str = "AvoidDiskWrites";
    pub const SOCKS_PORT: &str = "SocksPort";
    pub const LOG: &str = "Log";
    pub const GEOIP_FILE: &str = "GeoIPFile";
    pub const GEOIP6_FILE: &str = "GeoIPv6File";
    pub const DATA_DIRECTORY: &str = "DataDirectory";
    pub const CLIENT_ONION_AUTH_DIR: &str = "ClientOnionAuthDir";
    pub const CONTROL_PORT: &str = "ControlPort";
    pub const CONTROL_PORT_WRITE_TO_FILE: &str = "ControlPortWriteToFile";
    pub const COOKIE_AUTHENTICATION: &str = "CookieAuthentication";
    pub const OWNING_CONTROLLER_PROCESS: &str = "__OwningControllerProcess";
    pub const CLIENT_TRANSPORT_PLUGIN: &str = "ClientTransportPlugin";
    pub const BRIDGE: &str = "Bridge";
    pub const USE_BRIDGES: &str = "UseBridges";
    pub const DISABLE_NETWORK: &str = "DisableNetwork";
    pub const CLIENT_PREFER_IPV6_OR_PORT: &str = "ClientPreferIPv6ORPort";
    pub const CLIENT_USE_IPV4: &str = "ClientUseIPv4";
    pub const CLIENT_USE_IPV6: &str = "ClientUseIPv6";
}

/// One daemon option
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigEntry {
    key: String,
    value: String,
}

impl ConfigEntry {
    /// Create a new entry
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Option name
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw (unquoted) value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Render as launch arguments: `["--Key", "value"]`
    pub fn to_arguments(&self) -> [String; 2] {
        [format!("--{}", self.key), self.value.clone()]
    }

    /// Render as a `SETCONF` fragment: `Key="value"`
    ///
    /// Quotes and backslashes in the value are escaped, as the control
    /// protocol's QuotedString requires.
    pub fn to_setconf(&self) -> String {
        format!("{}={}", self.key, quote(&self.value))
    }
}

impl fmt::Display for ConfigEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.value)
    }
}

/// Flatten entries into a launch argument vector
pub fn to_arguments<'a>(entries: impl IntoIterator<Item = &'a ConfigEntry>) -> Vec<String> {
    entries
        .into_iter()
        .flat_map(ConfigEntry::to_arguments)
        .collect()
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
