use std::collections::BTreeMap;

use chrono::{FixedOffset, NaiveDate, Offset as _, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Seconds east of UTC for the default scraping home zone (UTC+09:30).
const HOME_ZONE_SECS: i32 = 9 * 3600 + 1800;

/// Today's date in the default scraping home zone (UTC+09:30).
pub fn today_home_zone() -> NaiveDate {
    let offset = FixedOffset::east_opt(HOME_ZONE_SECS).unwrap_or(Utc.fix());
    Utc::now().with_timezone(&offset).date_naive()
}

/// One scraped planning record.
///
/// Field values arrive as strings straight off the wire; [`Record::validate`]
/// is the gate every record passes before a sink will persist it. Unknown
/// payload fields are retained in `extra` rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Label of the authority that produced this record, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_label: Option<String>,
    /// The authority's own reference for the application.
    pub council_reference: String,
    /// Street address of the application site.
    pub address: String,
    /// Human-readable description of the application.
    pub description: String,
    /// Absolute link to the application detail page.
    pub info_url: String,
    /// Date this record was scraped, `YYYY-MM-DD`. Feeds rarely carry
    /// this; the scrape body stamps it before the sink sees the record.
    #[serde(default)]
    pub date_scraped: String,
    /// Date the application was received, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_received: Option<String>,
    /// Start of the public-notice window, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_notice_from: Option<String>,
    /// End of the public-notice window, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_notice_to: Option<String>,
    /// Any additional payload fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Why a record failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// A required string field was absent or empty.
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
    /// A field value did not parse as its expected shape.
    #[error("field `{field}` is not a valid {expected}: {value:?}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// What the field was expected to be.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },
    /// `date_received` lies after the scrape date.
    #[error("field `date_received` is in the future: {0:?}")]
    FutureDate(String),
}

impl Record {
    /// Validates the record against the persistence contract.
    ///
    /// Required string fields must be non-empty, `info_url` must be an
    /// absolute http(s) URL with a host, date fields must be real
    /// `YYYY-MM-DD` dates, and `date_received` must not be after `today`.
    pub fn validate(&self, today: NaiveDate) -> Result<(), RecordError> {
        require("council_reference", &self.council_reference)?;
        require("address", &self.address)?;
        require("description", &self.description)?;
        require("info_url", &self.info_url)?;
        require("date_scraped", &self.date_scraped)?;

        check_info_url(&self.info_url)?;
        parse_date("date_scraped", &self.date_scraped)?;

        if let Some(received) = &self.date_received {
            let date = parse_date("date_received", received)?;
            if date > today {
                return Err(RecordError::FutureDate(received.clone()));
            }
        }
        if let Some(value) = &self.on_notice_from {
            parse_date("on_notice_from", value)?;
        }
        if let Some(value) = &self.on_notice_to {
            parse_date("on_notice_to", value)?;
        }
        Ok(())
    }

    /// The record's primary key: `(authority_label, council_reference)` when
    /// the label is present, `(council_reference)` otherwise.
    pub fn primary_key(&self) -> String {
        match self.authority_label.as_deref() {
            Some(label) if !label.is_empty() => format!("{label}/{}", self.council_reference),
            _ => self.council_reference.clone(),
        }
    }

    /// The `date_scraped` field as a date, when it parses.
    pub fn scraped_on(&self) -> Option<NaiveDate> {
        parse_date("date_scraped", &self.date_scraped).ok()
    }
}

fn require(field: &'static str, value: &str) -> Result<(), RecordError> {
    if value.trim().is_empty() {
        return Err(RecordError::MissingField(field));
    }
    Ok(())
}

fn check_info_url(value: &str) -> Result<(), RecordError> {
    let invalid = || RecordError::Invalid {
        field: "info_url",
        expected: "absolute http(s) URL",
        value: value.to_string(),
    };

    let url = Url::parse(value).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, RecordError> {
    let invalid = || RecordError::Invalid {
        field,
        expected: "YYYY-MM-DD date",
        value: value.to_string(),
    };

    if !is_iso_date_shape(value) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid())
}

fn is_iso_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && [0, 1, 2, 3, 5, 6, 8, 9]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit())
}
