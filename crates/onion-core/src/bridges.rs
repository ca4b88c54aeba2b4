//! Bridge Selection
//!
//! The user's bridge choice as it arrives from settings ([`BridgeSettings`])
//! and the effective strategy derived from it ([`BridgeStrategy`]).
//!
//! Change detection is structural: a different type, a different custom
//! list, or a list that appears or disappears all count as a change.

use serde::{Deserialize, Serialize};

/// Fixed bridge line used with the domain-fronted transport.
///
/// The address is a reserved documentation address. The daemon insists on a
/// syntactically valid `Bridge` line and the fingerprint must match, even
/// though the helper does the actual routing out of band.
pub const SNOWFLAKE_BRIDGE_LINE: &str =
    "snowflake 192.0.2.3:1 2B280B23E1107BB62ABFC40DDCC8824814F80A72";

/// Bridge type as selected in settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeType {
    /// Direct connection
    #[default]
    None,
    /// Built-in obfs4 bridges
    Obfs4,
    /// User-supplied obfs4 bridges
    Custom,
    /// Domain-fronted snowflake
    Snowflake,
}

impl BridgeType {
    /// Get type name as used in config files
    pub fn name(&self) -> &'static str {
        match self {
            BridgeType::None => "none",
            BridgeType::Obfs4 => "obfs4",
            BridgeType::Custom => "custom",
            BridgeType::Snowflake => "snowflake",
        }
    }
}

impl std::fmt::Display for BridgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BridgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(BridgeType::None),
            "obfs4" => Ok(BridgeType::Obfs4),
            "custom" => Ok(BridgeType::Custom),
            "snowflake" => Ok(BridgeType::Snowflake),
            _ => Err(format!("unknown bridge type: {s}")),
        }
    }
}

/// Effective bridge strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStrategy {
    /// Connect directly
    None,
    /// obfs4 with the built-in bridge list
    BuiltInObfs4,
    /// obfs4 with the given bridge lines
    CustomObfs4(Vec<String>),
    /// Domain-fronted snowflake
    Snowflake,
}

impl BridgeStrategy {
    /// Does this strategy route through a bridge?
    pub fn uses_bridges(&self) -> bool {
        !matches!(self, BridgeStrategy::None)
    }
}

/// Bridge configuration as last requested by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Selected bridge type
    pub bridge_type: BridgeType,
    /// Custom bridge lines (only meaningful for [`BridgeType::Custom`])
    pub custom_bridges: Option<Vec<String>>,
}

impl BridgeSettings {
    /// Create new settings
    pub fn new(bridge_type: BridgeType, custom_bridges: Option<Vec<String>>) -> Self {
        Self {
            bridge_type,
            custom_bridges,
        }
    }

    /// Would switching to `requested` require reconfiguring a running daemon?
    pub fn differs_from(&self, requested: &BridgeSettings) -> bool {
        self != requested
    }

    /// Derive the effective strategy
    pub fn strategy(&self) -> BridgeStrategy {
        match self.bridge_type {
            BridgeType::None => BridgeStrategy::None,
            BridgeType::Obfs4 => BridgeStrategy::BuiltInObfs4,
            BridgeType::Custom => {
                BridgeStrategy::CustomObfs4(self.custom_bridges.clone().unwrap_or_default())
            }
            BridgeType::Snowflake => BridgeStrategy::Snowflake,
        }
    }
}
