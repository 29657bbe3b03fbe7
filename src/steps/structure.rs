//! Structured extraction: one language-model call per datasheet, turning
//! its text plus the scraped rows into a `ConverterBatch`.
//!
//! Outputs per datasheet group: `{pdf_hash}_pdf.json` (the batch) and
//! `{pdf_hash}_html.json` (the scraped rows). The lane's deduplicated product
//! list is `{product_type}_index.csv`. Model responses go through the
//! extraction cache, namespaced by this step's versioned name.

use async_trait::async_trait;
use serde::Deserialize;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::adapters::{with_retry, ExternalError, StructuredExtractor};
use crate::cache::CacheKey;
use crate::core::step::{Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{ConverterBatch, ProductType, Record, StepKind, Table};
use crate::storage::ContentDigest;

use super::{group_by, group_product_fields, PART_NUMBER, PDF_HASH, TEXT_HASH};

pub struct StructureData;

pub fn index_file(product_type: ProductType) -> String {
    format!("{}_index.csv", product_type)
}

pub fn batch_file(pdf_hash: &str) -> String {
    format!("{}_pdf.json", pdf_hash)
}

pub fn rows_file(pdf_hash: &str) -> String {
    format!("{}_html.json", pdf_hash)
}

/// Product rows with a `type` column, first occurrence of each part number kept
fn normalize(products: Table, product_type: ProductType) -> Table {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Table::new();

    for mut row in products.into_rows() {
        if let Some(part) = row.get_nonempty(PART_NUMBER) {
            if seen.iter().any(|p| p == part) {
                continue;
            }
            seen.push(part.to_string());
        }
        if row.get_nonempty("type").is_none() {
            row.set("type", product_type.converter_type());
        }
        out.push(row);
    }

    out
}

/// Context payload for one group: its reference columns, common fields hoisted
pub fn extraction_context(rows: &[Record], reference_columns: &[&str]) -> serde_json::Value {
    group_product_fields(rows.iter().map(|r| r.project(reference_columns)).collect())
}

fn malformed(error: &impl std::fmt::Display) -> StepError {
    StepError::External(ExternalError::malformed("structured extraction", error.to_string()))
}

fn parse_batch(document: &serde_json::Value) -> Result<ConverterBatch, StepError> {
    ConverterBatch::deserialize(document).map_err(|e| malformed(&e))
}

/// Structure one datasheet group; `Ok(true)` when no extraction call was made
async fn structure_group(
    ctx: &StepContext,
    extractor: &dyn StructuredExtractor,
    inv: &StepInvocation,
    pdf_hash: &str,
    rows: &[Record],
) -> Result<bool, StepError> {
    let steps = &ctx.storage.steps;
    let batch = batch_file(pdf_hash);
    let html = rows_file(pdf_hash);

    if steps.exists(&inv.step_name, &batch).await? && steps.exists(&inv.step_name, &html).await? {
        debug!(pdf_hash, "Datasheet already structured");
        return Ok(true);
    }

    let text_hash = rows
        .iter()
        .find_map(|r| r.get_nonempty(TEXT_HASH))
        .ok_or_else(|| StepError::MalformedData(format!("no {} for datasheet {}", TEXT_HASH, pdf_hash)))?;
    let text = ctx.storage.cas.get_text(&ContentDigest::parse(text_hash)?).await?;

    let context = extraction_context(rows, inv.lane.manufacturer.profile().reference_columns);
    let key = CacheKey::derive(&text, &context, ctx.settings.cache_key);

    // The model's document is cached as returned, once it parses as a batch
    let fetched = ctx
        .cache
        .compute_or_fetch::<serde_json::Value, StepError, _, _>(&inv.step_name, &key, || async {
            let raw = with_retry(
                "structured extraction",
                &ctx.settings.retry,
                ctx.settings.call_timeout,
                || extractor.extract(&text, &context, rows.len()),
            )
            .await?;

            let document: serde_json::Value = serde_json::from_str(&raw).map_err(|e| malformed(&e))?;
            parse_batch(&document)?;
            Ok(document)
        })
        .await?;
    let parsed = parse_batch(&fetched.value)?;

    steps.write_json(&inv.step_name, &batch, &fetched.value).await?;
    steps.write_json(&inv.step_name, &html, rows).await?;

    debug!(
        pdf_hash,
        converters = parsed.power_converters.len(),
        cache_hit = fetched.hit,
        "Datasheet structured"
    );
    Ok(fetched.hit)
}

#[async_trait]
impl Step for StructureData {
    fn kind(&self) -> StepKind {
        StepKind::StructureData
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let extractor = ctx
            .collaborators
            .structured_extractor()
            .ok_or_else(|| inv.missing("structured extractor"))?;
        let extractor = extractor.as_ref();

        let products = normalize(ctx.input_table(inv).await?, inv.lane.product_type);
        let (groups, blank) = group_by(products.rows(), PDF_HASH);

        let mut tally = UnitTally::new(groups.len() + blank);
        for _ in 0..blank {
            tally.skipped();
        }

        info!(lane = %inv.lane, products = products.len(), datasheets = groups.len(), "Structuring datasheets");

        let mut outcomes = stream::iter(groups)
            .map(move |(pdf_hash, rows)| async move {
                let outcome = structure_group(ctx, extractor, inv, &pdf_hash, &rows).await;
                (pdf_hash, outcome)
            })
            .buffer_unordered(ctx.settings.extraction_concurrency);

        while let Some((pdf_hash, outcome)) = outcomes.next().await {
            match outcome {
                Ok(true) => tally.reused(),
                Ok(false) => tally.succeeded(),
                Err(e) => {
                    warn!(pdf_hash = %pdf_hash, error = %e, "Structured extraction failed");
                    tally.failed(&pdf_hash, e);
                }
            }
        }

        let file_name = index_file(inv.lane.product_type);
        if tally.counts().count > 0 {
            ctx.storage
                .steps
                .write_table(&inv.step_name, &file_name, &products)
                .await?;
        }

        Ok(tally.into_output(file_name))
    }
}
