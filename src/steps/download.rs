//! Asset download: every product's datasheet (and image, where the site has
//! one) is fetched into the content store and referenced by digest.
//!
//! A `url → digest` side table lives next to the output so a rerun only
//! fetches what is new. Each URL is downloaded once per run no matter how
//! many products share it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::adapters::{with_retry, Downloader};
use crate::cache::HashIndex;
use crate::core::step::{Checkpointer, Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{ManufacturerProfile, ProductType, Record, StepKind, Table};
use crate::storage::ContentDigest;

use super::{unit_label, IMAGE_HASH, PDF_HASH};

pub struct DownloadAssets;

/// Side table file of the lane: URL → content digest
pub fn url_index_file(product_type: ProductType) -> String {
    format!("{}_url_hash_index.json", product_type)
}

/// Absolute links of one product row
#[derive(Debug, Clone, Default, PartialEq)]
struct RowLinks {
    datasheet: Option<String>,
    image: Option<String>,
}

impl RowLinks {
    fn of(row: &Record, profile: &ManufacturerProfile) -> Self {
        let link = |column: &str| row.get(column).and_then(|l| profile.absolute_link(l));
        Self {
            datasheet: link(profile.datasheet_column),
            image: profile.image_column.and_then(link),
        }
    }
}

/// Digest per URL, and whether it came from the side table
type Resolved = HashMap<String, Result<(ContentDigest, bool), String>>;

async fn fetch(ctx: &StepContext, downloader: &dyn Downloader, url: &str) -> Result<ContentDigest, StepError> {
    let bytes = with_retry("download", &ctx.settings.retry, ctx.settings.call_timeout, || {
        downloader.download(url)
    })
    .await?;
    Ok(ctx.storage.cas.put(&bytes).await?)
}

/// Output rows for every product whose datasheet is resolved so far.
///
/// Rows whose datasheet is still pending are left out without touching the
/// tally, which lets checkpoints reuse this for partial tables.
fn assemble(rows: &[Record], links: &[RowLinks], resolved: &Resolved, tally: &mut UnitTally) -> Table {
    let mut out = Table::new();
    out.ensure_column(PDF_HASH);
    out.ensure_column(IMAGE_HASH);

    for (i, (row, links)) in rows.iter().zip(links).enumerate() {
        let Some(datasheet) = &links.datasheet else {
            tally.skipped();
            continue;
        };

        match resolved.get(datasheet) {
            Some(Ok((digest, reused))) => {
                let image = links
                    .image
                    .as_ref()
                    .and_then(|url| resolved.get(url))
                    .and_then(|r| r.as_ref().ok())
                    .map(|(d, _)| d.as_str())
                    .unwrap_or("");

                let mut row = row.clone();
                row.set(PDF_HASH, digest.as_str());
                row.set(IMAGE_HASH, image);
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
impl Step for DownloadAssets {
    fn kind(&self) -> StepKind {
        StepKind::DownloadAssets
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let downloader = ctx
            .collaborators
            .downloader()
            .ok_or_else(|| inv.missing("downloader"))?;
        let downloader = downloader.as_ref();

        let products = ctx.input_table(inv).await?;
        let profile = inv.lane.manufacturer.profile();
        let file_name = inv.lane.product_type.table_file();
        let steps = &ctx.storage.steps;

        let links: Vec<RowLinks> = products.rows().iter().map(|r| RowLinks::of(r, profile)).collect();

        let mut urls: Vec<&String> = Vec::new();
        for link in links.iter().flat_map(|l| l.datasheet.iter().chain(l.image.iter())) {
            if !urls.contains(&link) {
                urls.push(link);
            }
        }

        let mut index = HashIndex::load(steps, &inv.step_name, &url_index_file(inv.lane.product_type)).await?;
        let mut resolved = Resolved::new();
        let mut pending = Vec::new();

        for url in urls {
            let known = index.get(url).and_then(|d| ContentDigest::parse(d).ok());
            match known {
                Some(digest) if ctx.storage.cas.exists(&digest).await => {
                    resolved.insert(url.clone(), Ok((digest, true)));
                }
                _ => {
                    index.remove(url);
                    pending.push(url.clone());
                }
            }
        }

        debug!(
            lane = %inv.lane,
            reused = resolved.len(),
            pending = pending.len(),
            "Resolved download set"
        );

        let mut checkpoint = Checkpointer::new(ctx.settings.checkpoint_interval);
        let mut downloads = stream::iter(pending)
            .map(move |url| async move {
                let outcome = fetch(ctx, downloader, &url).await;
                (url, outcome)
            })
            .buffer_unordered(ctx.settings.download_concurrency);

        while let Some((url, outcome)) = downloads.next().await {
            match outcome {
                Ok(digest) => {
                    index.insert(url.as_str(), digest.as_str());
                    resolved.insert(url, Ok((digest, false)));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Download failed");
                    resolved.insert(url, Err(e.to_string()));
                }
            }

            if checkpoint.tick() {
                index.save(steps).await?;
                let partial = assemble(products.rows(), &links, &resolved, &mut UnitTally::default());
                if !partial.is_empty() {
                    steps.write_table(&inv.step_name, &file_name, &partial).await?;
                }
            }
        }

        index.save(steps).await?;

        let mut tally = UnitTally::new(products.len());
        let table = assemble(products.rows(), &links, &resolved, &mut tally);
        if tally.counts().count > 0 {
            steps.write_table(&inv.step_name, &file_name, &table).await?;
        }

        info!(
            lane = %inv.lane,
            products = products.len(),
            downloaded = table.len(),
            "Assets downloaded"
        );
        Ok(tally.into_output(file_name))
    }
}
