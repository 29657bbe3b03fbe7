//! Manufacturers, product types and the lanes they form.
//!
//! A lane is the sequence of steps executed for one
//! `(manufacturer, product_type)` pair. Lanes share no data with each other.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing trigger input
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaneError {
    #[error("Unknown manufacturer: {0}")]
    UnknownManufacturer(String),

    #[error("Unknown product type: {0}")]
    UnknownProductType(String),

    #[error("Trigger payload lists no product types")]
    NoProductTypes,
}

/// Supported vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manufacturer {
    Recom,
    Traco,
    #[serde(rename = "xppower")]
    XpPower,
}

impl Manufacturer {
    pub const ALL: [Manufacturer; 3] = [Self::Recom, Self::Traco, Self::XpPower];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recom => "recom",
            Self::Traco => "traco",
            Self::XpPower => "xppower",
        }
    }
}

/// Static per-manufacturer layout of the scraped tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManufacturerProfile {
    /// Column carrying the datasheet URL
    pub datasheet_column: &'static str,

    /// Column carrying a product image URL, if the site has one
    pub image_column: Option<&'static str>,

    /// Prefix for site-relative links
    pub link_base: &'static str,

    /// Columns handed to the structured extractor as reference context
    pub reference_columns: &'static [&'static str],
}

const RECOM_PROFILE: ManufacturerProfile = ManufacturerProfile {
    datasheet_column: "datasheet_link",
    image_column: Some("image_url"),
    link_base: "https://recom-power.com",
    reference_columns: &[
        "Mounting Type",
        "Certifications",
        "Isolation (kV)",
        "type",
        "series",
        "part_number",
        "power",
        "isolation",
        "vin",
        "main_vout",
        "package_style",
    ],
};

const TRACO_PROFILE: ManufacturerProfile = ManufacturerProfile {
    datasheet_column: "datasheet_link",
    image_column: None,
    link_base: "https://www.tracopower.com",
    reference_columns: &["type", "series", "part_number", "description", "features"],
};

const XPPOWER_PROFILE: ManufacturerProfile = ManufacturerProfile {
    datasheet_column: "datasheet",
    image_column: Some("image"),
    link_base: "https://www.xppower.com",
    reference_columns: &["type", "series", "part_number", "description"],
};

impl ManufacturerProfile {
    /// Absolute URL for a link cell; blank cells yield `None`
    pub fn absolute_link(&self, link: &str) -> Option<String> {
        let link = link.trim();
        if link.is_empty() {
            return None;
        }
        if link.starts_with("http://") || link.starts_with("https://") {
            return Some(link.to_string());
        }
        let sep = if link.starts_with('/') { "" } else { "/" };
        Some(format!("{}{}{}", self.link_base, sep, link))
    }
}

impl Manufacturer {
    pub fn profile(&self) -> &'static ManufacturerProfile {
        match self {
            Self::Recom => &RECOM_PROFILE,
            Self::Traco => &TRACO_PROFILE,
            Self::XpPower => &XPPOWER_PROFILE,
        }
    }
}

impl Default for Manufacturer {
    fn default() -> Self {
        Self::Recom
    }
}

impl std::fmt::Display for Manufacturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Manufacturer {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "recom" => Ok(Self::Recom),
            "traco" | "tracopower" => Ok(Self::Traco),
            "xppower" | "xp-power" => Ok(Self::XpPower),
            _ => Err(LaneError::UnknownManufacturer(s.to_string())),
        }
    }
}

/// Product families scraped per manufacturer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProductType {
    #[serde(rename = "dc-dc-converters")]
    DcDcConverters,
    #[serde(rename = "ac-dc-power-supplies")]
    AcDcPowerSupplies,
}

impl ProductType {
    pub const ALL: [ProductType; 2] = [Self::DcDcConverters, Self::AcDcPowerSupplies];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DcDcConverters => "dc-dc-converters",
            Self::AcDcPowerSupplies => "ac-dc-power-supplies",
        }
    }

    /// Converter type column value added to rows that lack one
    pub fn converter_type(&self) -> &'static str {
        match self {
            Self::DcDcConverters => "DCDC",
            Self::AcDcPowerSupplies => "ACDC",
        }
    }

    /// Name of the per-lane tabular artifact (`dc-dc-converters.csv`)
    pub fn table_file(&self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductType {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dc-dc-converters" | "dc-dc" | "dcdc" => Ok(Self::DcDcConverters),
            "ac-dc-power-supplies" | "ac-dc" | "acdc" => Ok(Self::AcDcPowerSupplies),
            _ => Err(LaneError::UnknownProductType(s.to_string())),
        }
    }
}

/// One `(manufacturer, product_type)` pair.
///
/// Serialises as the step invocation envelope `{manufacturer, product_type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lane {
    pub manufacturer: Manufacturer,
    pub product_type: ProductType,
}

impl Lane {
    pub fn new(manufacturer: Manufacturer, product_type: ProductType) -> Self {
        Self {
            manufacturer,
            product_type,
        }
    }

    /// Stable identifier used for lock files and journal keys
    pub fn key(&self) -> String {
        format!("{}_{}", self.manufacturer, self.product_type)
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.manufacturer, self.product_type)
    }
}

/// Payload accepted by every trigger surface (CLI, drop folder).
///
/// Missing fields fall back to `recom` and both product types, matching the
/// defaults of the HTTP trigger this replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default)]
    pub manufacturer: Manufacturer,

    #[serde(default = "default_product_types")]
    pub product_types: Vec<ProductType>,
}

fn default_product_types() -> Vec<ProductType> {
    ProductType::ALL.to_vec()
}

impl Default for TriggerPayload {
    fn default() -> Self {
        Self {
            manufacturer: Manufacturer::default(),
            product_types: default_product_types(),
        }
    }
}

impl TriggerPayload {
    pub fn new(manufacturer: Manufacturer, product_types: Vec<ProductType>) -> Self {
        Self {
            manufacturer,
            product_types,
        }
    }

    /// Parse a JSON trigger payload
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let payload: Self = serde_json::from_str(content)
            .map_err(|e| anyhow::anyhow!("Invalid trigger payload: {}", e))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), LaneError> {
        if self.product_types.is_empty() {
            return Err(LaneError::NoProductTypes);
        }
        Ok(())
    }

    /// Lanes in payload order, duplicates removed
    pub fn lanes(&self) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = Vec::new();
        for product_type in &self.product_types {
            let lane = Lane::new(self.manufacturer, *product_type);
            if !lanes.contains(&lane) {
                lanes.push(lane);
            }
        }
        lanes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manufacturer_round_trip() {
        for m in Manufacturer::ALL {
            assert_eq!(m.as_str().parse::<Manufacturer>().unwrap(), m);
        }
        assert_eq!("XP-Power".parse::<Manufacturer>().unwrap(), Manufacturer::XpPower);
        assert!("acme".parse::<Manufacturer>().is_err());
    }

    #[test]
    fn test_profile_links() {
        let traco = Manufacturer::Traco.profile();
        assert_eq!(
            traco.absolute_link("/fileadmin/ds/tmr.pdf").as_deref(),
            Some("https://www.tracopower.com/fileadmin/ds/tmr.pdf")
        );
        assert_eq!(
            traco.absolute_link("https://cdn.example.com/a.pdf").as_deref(),
            Some("https://cdn.example.com/a.pdf")
        );
        assert_eq!(traco.absolute_link("  "), None);
        assert_eq!(Manufacturer::XpPower.profile().datasheet_column, "datasheet");
    }

    #[test]
    fn test_product_type_aliases() {
        assert_eq!(
            "dc-dc".parse::<ProductType>().unwrap(),
            ProductType::DcDcConverters
        );
        assert_eq!(
            ProductType::AcDcPowerSupplies.table_file(),
            "ac-dc-power-supplies.csv"
        );
    }

    #[test]
    fn test_envelope_serialization() {
        let lane = Lane::new(Manufacturer::XpPower, ProductType::DcDcConverters);
        let json = serde_json::to_value(lane).unwrap();
        assert_eq!(json["manufacturer"], "xppower");
        assert_eq!(json["product_type"], "dc-dc-converters");
    }

    #[test]
    fn test_payload_defaults() {
        let payload = TriggerPayload::from_json("{}").unwrap();
        assert_eq!(payload.manufacturer, Manufacturer::Recom);
        assert_eq!(payload.lanes().len(), 2);
    }

    #[test]
    fn test_payload_deduplicates_lanes() {
        let payload = TriggerPayload::from_json(
            r#"{"manufacturer": "traco", "product_types": ["dc-dc-converters", "dc-dc-converters"]}"#,
        )
        .unwrap();
        assert_eq!(payload.lanes().len(), 1);
    }

    #[test]
    fn test_payload_rejects_empty_product_types() {
        assert!(TriggerPayload::from_json(r#"{"product_types": []}"#).is_err());
        assert!(TriggerPayload::from_json(r#"{"manufacturer": "acme"}"#).is_err());
    }
}
