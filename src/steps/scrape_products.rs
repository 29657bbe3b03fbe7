//! Product discovery: every series row is expanded into its product rows.
//!
//! Progress is flushed to the output table every few series. A rerun keeps
//! the rows of series already present in the output and only scrapes the
//! rest.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::adapters::with_retry;
use crate::core::step::{Checkpointer, Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{Record, StepKind, Table};

/// Series row columns that may carry the series name, most specific first
const SERIES_NAME_COLUMNS: [&str; 4] = ["product_series", "product_name", "series_name", "name"];

pub struct ScrapeProducts;

fn series_name(series: &Record, index: usize) -> String {
    SERIES_NAME_COLUMNS
        .iter()
        .find_map(|c| series.get_nonempty(c))
        .map(str::to_string)
        .unwrap_or_else(|| format!("series #{}", index + 1))
}

#[async_trait]
impl Step for ScrapeProducts {
    fn kind(&self) -> StepKind {
        StepKind::ScrapeProducts
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let scraper = ctx
            .collaborators
            .scraper(inv.lane.manufacturer)
            .ok_or_else(|| inv.missing("scraper"))?;

        let series_table = ctx.input_table(inv).await?;
        let file_name = inv.lane.product_type.table_file();
        let steps = &ctx.storage.steps;

        let earlier = match steps.read_table(&inv.step_name, &file_name).await {
            Ok(table) => table,
            Err(e) if e.is_not_found() => Table::new(),
            Err(e) => return Err(e.into()),
        };

        let mut tally = UnitTally::new(series_table.len());
        let mut products = Table::new();
        let mut checkpoint = Checkpointer::new(ctx.settings.checkpoint_interval);

        for (i, series) in series_table.rows().iter().enumerate() {
            let name = series_name(series, i);

            let scraped: Vec<&Record> = earlier
                .rows()
                .iter()
                .filter(|r| r.get("series") == Some(name.as_str()))
                .collect();
            if !scraped.is_empty() {
                debug!(series = %name, products = scraped.len(), "Series already scraped");
                for row in scraped {
                    products.push(row.clone());
                }
                tally.reused();
                continue;
            }

            let result = with_retry("scraper", &ctx.settings.retry, ctx.settings.call_timeout, || {
                scraper.scrape_products(&inv.lane, series)
            })
            .await;

            match result {
                Ok(rows) => {
                    debug!(series = %name, products = rows.len(), "Series scraped");
                    for mut row in rows {
                        if row.get_nonempty("series").is_none() {
                            row.set("series", name.clone());
                        }
                        products.push(row);
                    }
                    tally.succeeded();
                }
                Err(e) => {
                    warn!(series = %name, error = %e, "Series failed");
                    tally.failed(&name, e);
                }
            }

            if checkpoint.tick() && !products.is_empty() {
                steps.write_table(&inv.step_name, &file_name, &products).await?;
            }
        }

        if tally.counts().count > 0 {
            steps.write_table(&inv.step_name, &file_name, &products).await?;
        }

        info!(lane = %inv.lane, series = series_table.len(), products = products.len(), "Products scraped");
        Ok(tally.into_output(file_name))
    }
}
