//! The six pipeline stages.
//!
//! Each stage implements `core::step::Step`. Stages share a few row
//! helpers: grouping products by the datasheet they came from, and the
//! context payload sent along with a datasheet for structured extraction.

pub mod download;
pub mod extract_text;
pub mod scrape_products;
pub mod scrape_series;
pub mod structure;
pub mod validate;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::step::Step;
use crate::domain::{Issue, PowerConverter, Record};

pub use download::DownloadAssets;
pub use extract_text::ExtractText;
pub use scrape_products::ScrapeProducts;
pub use scrape_series::ScrapeSeries;
pub use structure::StructureData;
pub use validate::Validate;

/// Column added by the download step: CAS digest of the datasheet
pub const PDF_HASH: &str = "pdf_hash";
/// Column added by the download step: CAS digest of the product image
pub const IMAGE_HASH: &str = "image_hash";
/// Column added by the text step: CAS digest of the extracted text
pub const TEXT_HASH: &str = "latex_hash";
pub const PART_NUMBER: &str = "part_number";

/// One datasheet's worth of validated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedEntry {
    /// Datasheet digest shared by the group
    pub hash: String,
    /// Converters that passed validation
    pub pdf: Vec<PowerConverter>,
    /// Scraped product rows of the group
    pub html: Vec<Record>,
    /// Regex fields extracted from the datasheet text
    pub fields: Record,
    /// Why dropped converters were dropped
    #[serde(default)]
    pub issues: Vec<Issue>,
}

/// Implementations for every step of the standard pipeline
pub fn standard_steps() -> Vec<Arc<dyn Step>> {
    vec![
        Arc::new(ScrapeSeries),
        Arc::new(ScrapeProducts),
        Arc::new(DownloadAssets),
        Arc::new(ExtractText),
        Arc::new(StructureData),
        Arc::new(Validate),
    ]
}

/// How a product row is named in failure messages
pub(crate) fn unit_label(row: &Record, index: usize) -> String {
    match row.get_nonempty(PART_NUMBER) {
        Some(part) => part.to_string(),
        None => format!("row {}", index + 1),
    }
}

/// Rows grouped by `column`, in order of first appearance. Rows with a
/// blank value are returned separately.
pub(crate) fn group_by(rows: &[Record], column: &str) -> (Vec<(String, Vec<Record>)>, usize) {
    let mut groups: Vec<(String, Vec<Record>)> = Vec::new();
    let mut blank = 0;

    for row in rows {
        let Some(value) = row.get_nonempty(column) else {
            blank += 1;
            continue;
        };
        match groups.iter_mut().find(|(k, _)| k == value) {
            Some((_, members)) => members.push(row.clone()),
            None => groups.push((value.to_string(), vec![row.clone()])),
        }
    }

    (groups, blank)
}

/// Context payload for one datasheet: fields shared by every product are
/// hoisted into `common_series_info`, the rest stay per product.
pub(crate) fn group_product_fields(mut records: Vec<Record>) -> serde_json::Value {
    let mut common = Record::new();

    if let Some(first) = records.first().cloned() {
        for (key, value) in first.iter() {
            if records.iter().all(|r| r.get(key) == Some(value)) {
                common.set(key, value);
            }
        }
        for record in &mut records {
            for key in common.keys() {
                record.remove(key);
            }
        }
    }

    serde_json::json!({
        "common_series_info": common,
        "products": records,
    })
}
