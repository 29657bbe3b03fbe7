//! Series discovery: one row per product series of the lane.

use async_trait::async_trait;

use crate::adapters::with_retry;
use crate::core::step::{Step, StepContext, StepError, StepInvocation, StepOutput, UnitTally};
use crate::domain::{StepKind, Table};

pub struct ScrapeSeries;

#[async_trait]
impl Step for ScrapeSeries {
    fn kind(&self) -> StepKind {
        StepKind::ScrapeSeries
    }

    async fn execute(&self, ctx: &StepContext, inv: &StepInvocation) -> Result<StepOutput, StepError> {
        let scraper = ctx
            .collaborators
            .scraper(inv.lane.manufacturer)
            .ok_or_else(|| inv.missing("scraper"))?;

        let rows = with_retry("scraper", &ctx.settings.retry, ctx.settings.call_timeout, || {
            scraper.scrape_series(&inv.lane)
        })
        .await?;

        let table = Table::from_records(rows);
        let file_name = inv.lane.product_type.table_file();
        if !table.is_empty() {
            ctx.storage
                .steps
                .write_table(&inv.step_name, &file_name, &table)
                .await?;
        }

        let mut tally = UnitTally::new(table.len());
        for _ in table.rows() {
            tally.succeeded();
        }
        Ok(tally.into_output(file_name))
    }
}
