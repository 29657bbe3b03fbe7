//! Structured converter specifications returned by the language model.
//!
//! Field names and their order are part of the prompt contract: the model
//! is asked for exactly this shape, so renaming a field invalidates every
//! cached extraction. Bump the structured step's schema namespace when
//! changing anything here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LengthUnit {
    #[serde(rename = "mm")]
    Millimetre,
    #[serde(rename = "in")]
    Inch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub unit: LengthUnit,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    C,
    F,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub temperature: i64,
    pub unit: TemperatureUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeratingUnit {
    W,
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "%/K")]
    PercentPerKelvin,
    #[serde(rename = "%/C")]
    PercentPerCelsius,
}

/// How temperature affects output power
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerDerating {
    #[serde(default)]
    pub threshold: Option<Temperature>,
    pub unit: DeratingUnit,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConverterType {
    #[serde(rename = "DC/DC")]
    DcDc,
    #[serde(rename = "AC/DC")]
    AcDc,
}

impl ConverterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DcDc => "DC/DC",
            Self::AcDc => "AC/DC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    Single,
    Dual,
    Triple,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentPackage {
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub mounting_type: Option<String>,
    #[serde(default)]
    pub connection_type: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub brick_size: Option<String>,
    #[serde(default)]
    pub ip_rating: Option<String>,
}

/// Pin identifiers come back as either numbers or names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinId {
    Number(i64),
    Name(String),
}

impl std::fmt::Display for PinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Name(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    #[serde(default)]
    pub pin_id: Option<PinId>,
    #[serde(rename = "type")]
    pub pin_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationUnit {
    #[serde(rename = "VDC")]
    Vdc,
    #[serde(rename = "VAC")]
    Vac,
    Unknown,
}

impl IsolationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vdc => "VDC",
            Self::Vac => "VAC",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTestVoltage {
    #[serde(default)]
    pub duration_sec: Option<i64>,
    pub unit: IsolationUnit,
    pub voltage: i64,
}

/// One converter as described by its datasheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConverter {
    #[serde(default)]
    pub product_series: Option<String>,
    pub part_number: String,
    pub converter_type: ConverterType,

    #[serde(default)]
    pub ac_voltage_input_min: Option<f64>,
    #[serde(default)]
    pub ac_voltage_input_max: Option<f64>,
    #[serde(default)]
    pub dc_voltage_input_min: Option<f64>,
    #[serde(default)]
    pub dc_voltage_input_max: Option<f64>,
    #[serde(default)]
    pub input_voltage_tolerance: Option<f64>,

    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub is_regulated: Option<bool>,
    #[serde(default)]
    pub regulation_voltage_range: Option<String>,
    #[serde(default)]
    pub efficiency: Option<f64>,

    pub isolation_test_voltage: Vec<IsolationTestVoltage>,

    #[serde(default)]
    pub voltage_output_1: Option<f64>,
    #[serde(default)]
    pub voltage_output_2: Option<f64>,
    #[serde(default)]
    pub voltage_output_3: Option<f64>,
    #[serde(default)]
    pub i_out1: Option<f64>,
    #[serde(default)]
    pub i_out2: Option<f64>,
    #[serde(default)]
    pub i_out3: Option<f64>,

    #[serde(default)]
    pub output_type: Option<OutputType>,
    pub pins: Vec<Pin>,
    #[serde(default)]
    pub package: Option<ComponentPackage>,
    #[serde(default)]
    pub packaging_type: Option<String>,

    #[serde(default)]
    pub dimensions: Option<Dimensions>,
    #[serde(default)]
    pub certifications: Option<Vec<String>>,
    #[serde(default)]
    pub protections: Option<Vec<String>>,

    #[serde(default)]
    pub operating_temperature: Option<TemperatureRange>,
    pub power_derating: Vec<PowerDerating>,
}

/// A validation finding on one converter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub part_number: String,
    pub message: String,
}

impl PowerConverter {
    /// Domain checks the schema alone cannot express
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.part_number.trim().is_empty() {
            issues.push("Missing part number".to_string());
        }

        let ranges = [
            ("AC input voltage", self.ac_voltage_input_min, self.ac_voltage_input_max),
            ("DC input voltage", self.dc_voltage_input_min, self.dc_voltage_input_max),
            (
                "Operating temperature",
                self.operating_temperature.as_ref().and_then(|t| t.min),
                self.operating_temperature.as_ref().and_then(|t| t.max),
            ),
        ];
        for (label, min, max) in ranges {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    issues.push(format!("{} min {} greater than max {}", label, min, max));
                }
            }
        }

        if let Some(efficiency) = self.efficiency {
            if !(0.0..=100.0).contains(&efficiency) {
                issues.push(format!("Efficiency {} outside 0-100%", efficiency));
            }
        }

        if let Some(power) = self.power {
            if power < 0.0 {
                issues.push(format!("Negative power {}", power));
            }
        }

        issues
    }
}

/// The full response for one datasheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterBatch {
    /// Repeated back by the model so it is clear a list is expected
    pub part_numbers_to_extract: Vec<String>,
    pub power_converters: Vec<PowerConverter>,
}

impl ConverterBatch {
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Split converters into those passing domain checks and the issues of the rest
    pub fn partition_valid(self) -> (Vec<PowerConverter>, Vec<Issue>) {
        let mut valid = Vec::new();
        let mut issues = Vec::new();

        for converter in self.power_converters {
            let found = converter.issues();
            if found.is_empty() {
                valid.push(converter);
            } else {
                issues.extend(found.into_iter().map(|message| Issue {
                    part_number: converter.part_number.clone(),
                    message,
                }));
            }
        }

        (valid, issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "part_numbers_to_extract": ["R-78B5.0-1.0"],
        "power_converters": [{
            "product_series": "R-78B",
            "part_number": "R-78B5.0-1.0",
            "converter_type": "DC/DC",
            "dc_voltage_input_min": 6.5,
            "dc_voltage_input_max": 32,
            "efficiency": 94,
            "isolation_test_voltage": [],
            "voltage_output_1": 5.0,
            "i_out1": 1.0,
            "output_type": "Single",
            "pins": [{"pin_id": 1, "type": "+VDC in"}, {"pin_id": "GND", "type": "Gnd"}],
            "operating_temperature": {"min": -40, "max": 85},
            "power_derating": [{"threshold": {"temperature": 71, "unit": "C"}, "unit": "%/C", "rate": 2.5}]
        }]
    }"#;

    #[test]
    fn test_parse_sample() {
        let batch = ConverterBatch::from_json(SAMPLE).unwrap();
        let converter = &batch.power_converters[0];

        assert_eq!(converter.converter_type, ConverterType::DcDc);
        assert_eq!(converter.pins[0].pin_id, Some(PinId::Number(1)));
        assert_eq!(converter.pins[1].pin_id, Some(PinId::Name("GND".to_string())));
        assert_eq!(
            converter.power_derating[0].unit,
            DeratingUnit::PercentPerCelsius
        );
        assert!(converter.issues().is_empty());
    }

    #[test]
    fn test_unknown_literal_is_rejected() {
        let bad = SAMPLE.replace("\"DC/DC\"", "\"DC-DC\"");
        assert!(ConverterBatch::from_json(&bad).is_err());
    }

    #[test]
    fn test_missing_required_list_is_rejected() {
        let bad = SAMPLE.replace("\"pins\"", "\"pinout\"");
        assert!(ConverterBatch::from_json(&bad).is_err());
    }

    #[test]
    fn test_inverted_range_is_an_issue() {
        let mut batch = ConverterBatch::from_json(SAMPLE).unwrap();
        batch.power_converters[0].dc_voltage_input_min = Some(40.0);
        batch.power_converters[0].efficiency = Some(140.0);

        let (valid, issues) = batch.partition_valid();
        assert!(valid.is_empty());
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].part_number, "R-78B5.0-1.0");
    }
}
