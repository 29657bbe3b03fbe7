//! Validation: structured batches are checked converter by converter and
//! merged with the scraped rows and regex fields into one entry per
//! datasheet, ready to be loaded into a database.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::adapters::FieldExtractor;
use crate::core::step::{Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{ConverterBatch, ProductType, Record, StepKind};
use crate::storage::{ContentDigest, StorageError};

use super::structure::{batch_file, index_file, rows_file};
use super::{group_by, ValidatedEntry, PDF_HASH, TEXT_HASH};

pub struct Validate;

/// Output file of the lane
pub fn merged_file(product_type: ProductType) -> String {
    format!("{}_merged.json", product_type)
}

async fn read_group_file<T: serde::de::DeserializeOwned>(
    ctx: &StepContext,
    step: &str,
    file: &str,
) -> Result<T, StepError> {
    match ctx.storage.steps.read_json(step, file).await {
        Ok(value) => Ok(value),
        Err(StorageError::NotFound(_)) => Err(StepError::UpstreamMissing {
            step: step.to_string(),
            file: file.to_string(),
        }),
        Err(e @ StorageError::Json { .. }) => Err(StepError::MalformedData(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Datasheet text of the group, empty when it cannot be read
async fn group_text(ctx: &StepContext, pdf_hash: &str, rows: &[Record]) -> String {
    let Some(text_hash) = rows.iter().find_map(|r| r.get_nonempty(TEXT_HASH)) else {
        warn!(pdf_hash, "No text digest for datasheet; fields come from the product row only");
        return String::new();
    };

    let text = match ContentDigest::parse(text_hash) {
        Ok(digest) => ctx.storage.cas.get_text(&digest).await,
        Err(e) => Err(e),
    };
    text.unwrap_or_else(|e| {
        warn!(pdf_hash, error = %e, "Datasheet text unavailable");
        String::new()
    })
}

async fn validate_group(
    ctx: &StepContext,
    fields: &dyn FieldExtractor,
    input: &str,
    pdf_hash: &str,
    rows: &[Record],
) -> Result<ValidatedEntry, StepError> {
    let batch: ConverterBatch = read_group_file(ctx, input, &batch_file(pdf_hash)).await?;
    let html: Vec<Record> = read_group_file(ctx, input, &rows_file(pdf_hash)).await?;

    let (valid, issues) = batch.partition_valid();
    for issue in &issues {
        debug!(pdf_hash, part_number = %issue.part_number, issue = %issue.message, "Converter dropped");
    }
    if valid.is_empty() {
        return Err(StepError::MalformedData(format!(
            "no valid converters ({} issues)",
            issues.len()
        )));
    }

    let text = group_text(ctx, pdf_hash, rows).await;
    let reference = html.first().or_else(|| rows.first()).cloned().unwrap_or_default();
    let fields = fields.extract(&text, &reference);

    Ok(ValidatedEntry {
        hash: pdf_hash.to_string(),
        pdf: valid,
        html,
        fields,
        issues,
    })
}

#[async_trait]
impl Step for Validate {
    fn kind(&self) -> StepKind {
        StepKind::Validate
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let fields = ctx
            .collaborators
            .field_extractor(inv.lane.manufacturer)
            .ok_or_else(|| inv.missing("field extractor"))?;

        let input = inv.input()?;
        let index = ctx.read_table(input, &index_file(inv.lane.product_type)).await?;
        let (groups, blank) = group_by(index.rows(), PDF_HASH);

        let mut tally = UnitTally::new(groups.len() + blank);
        for _ in 0..blank {
            tally.skipped();
        }

        let mut entries = Vec::with_capacity(groups.len());
        let mut dropped = 0;

        for (pdf_hash, rows) in &groups {
            match validate_group(ctx, fields.as_ref(), input, pdf_hash, rows).await {
                Ok(entry) => {
                    dropped += entry.issues.len();
                    entries.push(entry);
                    tally.succeeded();
                }
                Err(e) => {
                    warn!(pdf_hash = %pdf_hash, error = %e, "Datasheet failed validation");
                    tally.failed(pdf_hash, e);
                }
            }
        }

        let file_name = merged_file(inv.lane.product_type);
        if tally.counts().count > 0 {
            ctx.storage
                .steps
                .write_json(&inv.step_name, &file_name, &entries)
                .await?;
        }

        info!(
            lane = %inv.lane,
            datasheets = groups.len(),
            valid = entries.len(),
            converters_dropped = dropped,
            "Validation finished"
        );
        Ok(tally.into_output(file_name))
    }
}
