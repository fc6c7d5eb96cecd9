//! Core domain model and paging arithmetic for the iNaturalist accretor.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "inat-core";

/// Deepest `page * page_size` offset the observations API will serve.
pub const OFFSET_CEILING: u64 = 10_000;

/// Format used for every persisted or transmitted observation date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("page_size must be at least 1")]
    ZeroPageSize,
    #[error("start_page must be at least 1")]
    ZeroStartPage,
    #[error(
        "page {page} with page_size {page_size} reaches offset {offset}, beyond the {OFFSET_CEILING} record ceiling"
    )]
    BeyondCeiling { page: u64, page_size: u64, offset: u64 },
}

/// Search parameters for one scrape job.
///
/// `place_id`, `taxon_id` and `page_size` never change once a job starts.
/// `start_page` and `date_cursor` move as the controller pages and rolls over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub place_id: u64,
    pub taxon_id: u64,
    pub page_size: u64,
    pub start_page: u64,
    /// Inclusive date bound of the current partition. Results are ascending by
    /// observation date, so this is the oldest date the partition may contain.
    pub date_cursor: Option<NaiveDate>,
    /// Optional fixed newest date, applied to every partition.
    pub observed_until: Option<NaiveDate>,
}

impl Query {
    pub fn new(place_id: u64, taxon_id: u64, page_size: u64, start_page: u64) -> Self {
        Self {
            place_id,
            taxon_id,
            page_size,
            start_page,
            date_cursor: None,
            observed_until: None,
        }
    }

    pub fn with_observed_until(mut self, observed_until: Option<NaiveDate>) -> Self {
        self.observed_until = observed_until;
        self
    }

    /// Check that `page` can still be requested without passing the offset ceiling.
    pub fn validate_depth(&self, page: u64) -> Result<(), QueryError> {
        if self.page_size == 0 {
            return Err(QueryError::ZeroPageSize);
        }
        if page == 0 {
            return Err(QueryError::ZeroStartPage);
        }
        let offset = page.saturating_mul(self.page_size);
        if offset > OFFSET_CEILING {
            return Err(QueryError::BeyondCeiling {
                page,
                page_size: self.page_size,
                offset,
            });
        }
        Ok(())
    }
}

/// True when the page after `page` would pass the offset ceiling.
pub fn crosses_offset_ceiling(page: u64, page_size: u64) -> bool {
    page.saturating_add(1).saturating_mul(page_size) > OFFSET_CEILING
}

/// One page of raw observation payloads as returned by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub page: u64,
    pub page_size: u64,
    pub raw: Vec<JsonValue>,
}

impl PageResult {
    pub fn new(page: u64, page_size: u64, raw: Vec<JsonValue>) -> Self {
        Self {
            page,
            page_size,
            raw,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// A short or empty page means the partition has no further pages.
    pub fn is_final_page(&self) -> bool {
        (self.raw.len() as u64) < self.page_size
    }
}

/// Normalized observation row, identified by the source's observation `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub id: i64,
    pub date: Option<NaiveDate>,
    pub genus: Option<String>,
    pub species: Option<String>,
    pub subspecies: Option<String>,
    /// `"[lat, long]"` rendering of the coordinates.
    pub coords: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub locality: Option<String>,
    pub introduced: Option<bool>,
    pub qual_grade: Option<String>,
}

impl ObservationRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            date: None,
            genus: None,
            species: None,
            subspecies: None,
            coords: None,
            lat: None,
            long: None,
            locality: None,
            introduced: None,
            qual_grade: None,
        }
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}
