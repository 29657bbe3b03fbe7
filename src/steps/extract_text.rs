//! Text extraction: each distinct datasheet is converted to text once and
//! the text stored in the content store. Product rows gain the digest of
//! their datasheet's text.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::adapters::{with_retry, TextExtractor};
use crate::cache::HashIndex;
use crate::core::step::{Checkpointer, Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{ProductType, Record, StepKind, Table};
use crate::storage::ContentDigest;

use super::{unit_label, PDF_HASH, TEXT_HASH};

pub struct ExtractText;

/// Side table file of the lane: datasheet digest → text digest
pub fn text_index_file(product_type: ProductType) -> String {
    format!("{}_latex_hash_index.json", product_type)
}

/// Text digest per datasheet digest, and whether it came from the side table
type Resolved = HashMap<String, Result<(ContentDigest, bool), String>>;

async fn extract(
    ctx: &StepContext,
    extractor: &dyn TextExtractor,
    pdf_hash: &str,
) -> Result<ContentDigest, StepError> {
    let digest = ContentDigest::parse(pdf_hash)?;
    let document = ctx.storage.cas.get(&digest).await?;

    let budget = extractor.time_budget(ctx.settings.call_timeout);
    let text = with_retry("text extraction", &ctx.settings.retry, budget, || {
        extractor.extract_text(&document)
    })
    .await?;

    Ok(ctx.storage.cas.put_text(&text).await?)
}

fn assemble(rows: &[Record], resolved: &Resolved, tally: &mut UnitTally) -> Table {
    let mut out = Table::new();
    out.ensure_column(TEXT_HASH);

    for (i, row) in rows.iter().enumerate() {
        let Some(pdf_hash) = row.get_nonempty(PDF_HASH) else {
            tally.skipped();
            continue;
        };

        match resolved.get(pdf_hash) {
            Some(Ok((digest, reused))) => {
                let mut row = row.clone();
                row.set(TEXT_HASH, digest.as_str());
                out.push(row);
                if *reused {
                    tally.reused();
                } else {
                    tally.succeeded();
                }
            }
            Some(Err(e)) => tally.failed(&unit_label(row, i), e),
            None => {}
        }
    }

    out
}

#[async_trait]
impl Step for ExtractText {
    fn kind(&self) -> StepKind {
        StepKind::ExtractText
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let extractor = ctx
            .collaborators
            .text_extractor()
            .ok_or_else(|| inv.missing("text extractor"))?;
        let extractor = extractor.as_ref();

        let products = ctx.input_table(inv).await?;
        let file_name = inv.lane.product_type.table_file();
        let steps = &ctx.storage.steps;

        let mut documents: Vec<&str> = Vec::new();
        for hash in products.rows().iter().filter_map(|r| r.get_nonempty(PDF_HASH)) {
            if !documents.contains(&hash) {
                documents.push(hash);
            }
        }

        let mut index = HashIndex::load(steps, &inv.step_name, &text_index_file(inv.lane.product_type)).await?;
        let mut resolved = Resolved::new();
        let mut pending = Vec::new();

        for pdf_hash in documents {
            let known = index.get(pdf_hash).and_then(|d| ContentDigest::parse(d).ok());
            match known {
                Some(digest) if ctx.storage.cas.exists(&digest).await => {
                    resolved.insert(pdf_hash.to_string(), Ok((digest, true)));
                }
                _ => {
                    index.remove(pdf_hash);
                    pending.push(pdf_hash.to_string());
                }
            }
        }

        info!(
            lane = %inv.lane,
            documents = resolved.len() + pending.len(),
            pending = pending.len(),
            "Extracting datasheet text"
        );

        let mut checkpoint = Checkpointer::new(ctx.settings.checkpoint_interval);
        let mut extractions = stream::iter(pending)
            .map(move |pdf_hash| async move {
                let outcome = extract(ctx, extractor, &pdf_hash).await;
                (pdf_hash, outcome)
            })
            .buffer_unordered(ctx.settings.extraction_concurrency);

        while let Some((pdf_hash, outcome)) = extractions.next().await {
            match outcome {
                Ok(digest) => {
                    index.insert(pdf_hash.as_str(), digest.as_str());
                    resolved.insert(pdf_hash, Ok((digest, false)));
                }
                Err(e) => {
                    warn!(pdf_hash = %pdf_hash, error = %e, "Text extraction failed");
                    resolved.insert(pdf_hash, Err(e.to_string()));
                }
            }

            if checkpoint.tick() {
                index.save(steps).await?;
                let partial = assemble(products.rows(), &resolved, &mut UnitTally::default());
                if !partial.is_empty() {
                    steps.write_table(&inv.step_name, &file_name, &partial).await?;
                }
            }
        }

        index.save(steps).await?;

        let mut tally = UnitTally::new(products.len());
        let table = assemble(products.rows(), &resolved, &mut tally);
        if tally.counts().count > 0 {
            steps.write_table(&inv.step_name, &file_name, &table).await?;
        }

        Ok(tally.into_output(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sharing_a_datasheet_share_its_text() {
        let text = ContentDigest::of(b"text");
        let rows = vec![
            Record::new().with("part_number", "A").with(PDF_HASH, "p1"),
            Record::new().with("part_number", "B").with(PDF_HASH, "p1"),
            Record::new().with("part_number", "C").with(PDF_HASH, ""),
            Record::new().with("part_number", "D").with(PDF_HASH, "p2"),
        ];
        let mut resolved = Resolved::new();
        resolved.insert("p1".into(), Ok((text.clone(), true)));
        resolved.insert("p2".into(), Err("Text extraction rejected: 400".into()));

        let mut tally = UnitTally::new(rows.len());
        let table = assemble(&rows, &resolved, &mut tally);

        assert_eq!(table.len(), 2);
        assert!(table.rows().iter().all(|r| r.get(TEXT_HASH) == Some(text.as_str())));
        let counts = tally.counts();
        assert_eq!((counts.count, counts.reused, counts.skipped, counts.failures), (2, 2, 1, 1));
    }
}
