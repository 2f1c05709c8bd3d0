//! Billing feed client
//!
//! The ingestion collaborator exposes cost records as a paged feed keyed
//! by date. The feed is eventually consistent and a date's records may
//! arrive days late, so every sync re-pulls a trailing window instead of
//! tracking a high-water mark; the append-only upsert makes the re-pull
//! idempotent.

use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::CostRecordRepository;
use crate::error::{Error, Result};
use crate::models::cost::CostRecordInput;

// Backstop against a feed that keeps returning next_page forever
const MAX_PAGES: u32 = 10_000;

/// One page of the billing feed
#[derive(Debug, Deserialize)]
pub struct FeedPage {
    /// Records on this page
    pub records: Vec<CostRecordInput>,
    /// Next page number, None on the last page
    pub next_page: Option<u32>,
}

/// HTTP client for the billing feed
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl FeedClient {
    /// Create a feed client for the given base URL
    pub fn new(base_url: impl Into<String>, page_size: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            page_size,
        })
    }

    /// Fetch one page of records for an inclusive date range
    pub async fn fetch_page(&self, from: NaiveDate, to: NaiveDate, page: u32) -> Result<FeedPage> {
        let url = format!("{}/cost-records", self.base_url.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .query(&[
                ("from", from.to_string()),
                ("to", to.to_string()),
                ("page", page.to_string()),
                ("page_size", self.page_size.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!("feed returned {status}: {body}")));
        }

        Ok(response.json().await?)
    }
}

/// Pulls the trailing feed window into the cost record store
pub struct FeedSync {
    client: FeedClient,
    records: CostRecordRepository,
    resync_days: u32,
}

impl FeedSync {
    /// Create a sync over the given client and repository
    pub fn new(client: FeedClient, records: CostRecordRepository, resync_days: u32) -> Self {
        Self {
            client,
            records,
            resync_days,
        }
    }

    /// Pull every page of the trailing window and store it. Returns the
    /// number of records that were actually new.
    pub async fn run(&self, today: NaiveDate) -> Result<usize> {
        let from = today - chrono::Duration::days(i64::from(self.resync_days));
        info!(%from, %today, "Syncing billing feed");

        let mut page = 0u32;
        let mut inserted = 0usize;

        loop {
            let feed_page = self.client.fetch_page(from, today, page).await?;
            debug!(page, records = feed_page.records.len(), "Fetched feed page");

            inserted += self.records.upsert_batch(&feed_page.records).await?;

            match feed_page.next_page {
                Some(next) if next > page && next < MAX_PAGES => page = next,
                Some(_) | None => break,
            }
        }

        metrics::counter!("costwatch_records_ingested_total").increment(inserted as u64);
        info!(inserted, "Feed sync complete");
        Ok(inserted)
    }
}
