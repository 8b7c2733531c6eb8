//! Typed column schema for wide SCADA tables.
//!
//! Columns are addressed by `(FeatureType, TurbineId)` pairs. The flat
//! `{feature}_{turbine}` naming only exists at the CSV boundary and is parsed
//! exactly once, in [`ColumnKey::parse`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    WindSpeed,
    WindDirection,
    NacelleDirection,
    PowerOutput,
    TurbineStatus,
    WdSin,
    WdCos,
    WsHorz,
    WsVert,
    NdSin,
    NdCos,
}

pub const ALL_FEATURES: [FeatureType; 11] = [
    FeatureType::WindSpeed,
    FeatureType::WindDirection,
    FeatureType::NacelleDirection,
    FeatureType::PowerOutput,
    FeatureType::TurbineStatus,
    FeatureType::WdSin,
    FeatureType::WdCos,
    FeatureType::WsHorz,
    FeatureType::WsVert,
    FeatureType::NdSin,
    FeatureType::NdCos,
];

impl FeatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindSpeed => "wind_speed",
            Self::WindDirection => "wind_direction",
            Self::NacelleDirection => "nacelle_direction",
            Self::PowerOutput => "power_output",
            Self::TurbineStatus => "turbine_status",
            Self::WdSin => "wd_sin",
            Self::WdCos => "wd_cos",
            Self::WsHorz => "ws_horz",
            Self::WsVert => "ws_vert",
            Self::NdSin => "nd_sin",
            Self::NdCos => "nd_cos",
        }
    }

    /// Angular features live in `[0, 360)` and need circular arithmetic.
    pub fn is_angular(self) -> bool {
        matches!(self, Self::WindDirection | Self::NacelleDirection)
    }

    pub fn is_engineered(self) -> bool {
        matches!(
            self,
            Self::WdSin | Self::WdCos | Self::WsHorz | Self::WsVert | Self::NdSin | Self::NdCos
        )
    }

    pub fn parse(raw: &str) -> Option<Self> {
        ALL_FEATURES.into_iter().find(|f| f.as_str() == raw)
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurbineId(String);

impl TurbineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurbineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TurbineId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub feature: FeatureType,
    pub turbine: TurbineId,
}

impl ColumnKey {
    pub fn new(feature: FeatureType, turbine: TurbineId) -> Self {
        Self { feature, turbine }
    }

    /// Parses a `{feature}_{turbine}` header. The longest matching feature
    /// prefix wins so that `wind_direction_wt01` never reads as `wind_*`.
    pub fn parse(name: &str) -> Option<Self> {
        let mut best: Option<FeatureType> = None;
        for feature in ALL_FEATURES {
            let prefix = feature.as_str();
            let matches = name.len() > prefix.len() + 1
                && name.starts_with(prefix)
                && name.as_bytes()[prefix.len()] == b'_';
            if matches && best.map_or(true, |b| b.as_str().len() < prefix.len()) {
                best = Some(feature);
            }
        }
        let feature = best?;
        let turbine = &name[feature.as_str().len() + 1..];
        Some(Self::new(feature, TurbineId::new(turbine)))
    }

    pub fn column_name(&self) -> String {
        format!("{}_{}", self.feature.as_str(), self.turbine.as_str())
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.feature.as_str(), self.turbine.as_str())
    }
}
