//! Regex field extraction from datasheet text.
//!
//! Each manufacturer formats its datasheets differently, so each gets its
//! own pattern set plus a list of columns copied from the scraped product row.

use regex::Regex;

use super::FieldExtractor;
use crate::domain::{Manufacturer, Record};

/// A pattern whose capture groups fill the named fields, in order
struct FieldPattern {
    regex: Regex,
    fields: &'static [&'static str],
}

type PatternTable = &'static [(&'static str, &'static [&'static str])];

const INPUT_RANGE: &[&str] = &["input_voltage_min", "input_voltage_max"];

const RECOM_PATTERNS: PatternTable = &[
    (r"Input voltage range\s*[:]\s*([\d\.\-]+)\s*to\s*([\d\.]+)\s*V", INPUT_RANGE),
    (r"Output voltage\s*[:]\s*([\d\.]+)\s*V", &["output_voltage"]),
    (r"Efficiency\s*[:]\s*([\d\.]+)\s*%", &["efficiency"]),
    (r"I/O isolation\s*[:]\s*([\d\.]+)\s*V", &["isolation"]),
];

const TRACO_PATTERNS: PatternTable = &[
    (r"Input voltage range\s*[:]\s*([\d\.\-]+)\s*to\s*([\d\.]+)\s*V", INPUT_RANGE),
    (r"Output voltage\s*[:]\s*([\d\.]+)\s*V", &["output_voltage"]),
    (r"Maximum output power\s*[:]\s*([\d\.]+)\s*W", &["max_power"]),
    (r"Isolation test voltage\s*[:]\s*([\d\.]+)\s*V", &["isolation"]),
    (
        r"Operating temperature range\s*[:]\s*([\-\d\.]+)\s*to\s*([\d\.]+)\s*°C",
        &["operating_temp_min", "operating_temp_max"],
    ),
];

const XPPOWER_PATTERNS: PatternTable = &[
    (r"Input Voltage Range\s*[:]\s*([\d\.\-]+)\s*to\s*([\d\.]+)\s*V", INPUT_RANGE),
    (r"Output Voltage\s*[:]\s*([\d\.]+)\s*V", &["output_voltage"]),
    (r"Output Power\s*[:]\s*([\d\.]+)\s*W", &["output_power"]),
    (r"Efficiency\s*[:]\s*([\d\.]+)\s*%", &["efficiency"]),
];

pub struct RegexFieldExtractor {
    patterns: Vec<FieldPattern>,
    reference_fields: &'static [&'static str],
}

impl RegexFieldExtractor {
    pub fn for_manufacturer(manufacturer: Manufacturer) -> Self {
        let (patterns, reference_fields): (PatternTable, &'static [&'static str]) =
            match manufacturer {
                Manufacturer::Recom => (
                    RECOM_PATTERNS,
                    &[
                        "series_name",
                        "description",
                        "series_power",
                        "series_mounting_type",
                        "series_package_style",
                    ],
                ),
                Manufacturer::Traco => (
                    TRACO_PATTERNS,
                    &["series_name", "efficiency", "power", "series_description"],
                ),
                Manufacturer::XpPower => (
                    XPPOWER_PATTERNS,
                    &["series_name", "power", "phase", "voltage", "current"],
                ),
            };

        Self {
            patterns: patterns
                .iter()
                .filter_map(|&(pattern, fields)| {
                    Regex::new(pattern).ok().map(|regex| FieldPattern { regex, fields })
                })
                .collect(),
            reference_fields,
        }
    }
}

impl FieldExtractor for RegexFieldExtractor {
    fn extract(&self, text: &str, reference: &Record) -> Record {
        let mut record = Record::new();

        for pattern in &self.patterns {
            if let Some(captures) = pattern.regex.captures(text) {
                for (i, field) in pattern.fields.iter().enumerate() {
                    if let Some(m) = captures.get(i + 1) {
                        record.set(*field, m.as_str());
                    }
                }
            }
        }

        // Scraped values fill in only what the text did not provide
        for field in self.reference_fields {
            if !record.contains(field) {
                record.set(*field, reference.get(field).unwrap_or(""));
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pattern_compiles() {
        assert_eq!(RegexFieldExtractor::for_manufacturer(Manufacturer::Recom).patterns.len(), RECOM_PATTERNS.len());
        assert_eq!(RegexFieldExtractor::for_manufacturer(Manufacturer::Traco).patterns.len(), TRACO_PATTERNS.len());
        assert_eq!(
            RegexFieldExtractor::for_manufacturer(Manufacturer::XpPower).patterns.len(),
            XPPOWER_PATTERNS.len()
        );
    }

    #[test]
    fn test_recom_fields() {
        let text = "R-78B\nInput voltage range: 6.5 to 32 V\nOutput voltage: 5.0 V\nEfficiency: 94 %\nI/O isolation: 1500 V\n";
        let reference = Record::new().with("series_name", "R-78B").with("unrelated", "x");

        let record = RegexFieldExtractor::for_manufacturer(Manufacturer::Recom).extract(text, &reference);

        assert_eq!(record.get("input_voltage_min"), Some("6.5"));
        assert_eq!(record.get("input_voltage_max"), Some("32"));
        assert_eq!(record.get("output_voltage"), Some("5.0"));
        assert_eq!(record.get("efficiency"), Some("94"));
        assert_eq!(record.get("isolation"), Some("1500"));
        assert_eq!(record.get("series_name"), Some("R-78B"));
        assert_eq!(record.get("description"), Some(""));
        assert!(!record.contains("unrelated"));
    }

    #[test]
    fn test_traco_temperature_range() {
        let text = "Operating temperature range: -40 to 85 °C\nMaximum output power: 6 W";
        let record = RegexFieldExtractor::for_manufacturer(Manufacturer::Traco).extract(text, &Record::new());

        assert_eq!(record.get("operating_temp_min"), Some("-40"));
        assert_eq!(record.get("operating_temp_max"), Some("85"));
        assert_eq!(record.get("max_power"), Some("6"));
        assert!(!record.contains("output_voltage"));
    }

    #[test]
    fn test_reference_fills_gaps() {
        let text = "Efficiency: 91 %";
        let reference = Record::new().with("efficiency", "88");
        let record = RegexFieldExtractor::for_manufacturer(Manufacturer::Traco).extract(text, &reference);
        assert_eq!(record.get("efficiency"), Some("88"));

        let record = RegexFieldExtractor::for_manufacturer(Manufacturer::XpPower).extract(text, &reference);
        assert_eq!(record.get("efficiency"), Some("91"));
    }
}
