//! Profile source contracts + Postgres and fixture-backed implementations.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pcdc_core::{ExtractError, ProfileRecord, Watermark};
use pcdc_storage::classify_sqlx_error;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "pcdc-adapters";

/// Read-only range query over profile rows.
///
/// `fetch_since` returns records with a creation timestamp strictly greater
/// than `threshold`, ascending, ties ordered by customer id. No new rows is an
/// empty vector, not an error. Implementations do not retry.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_since(&self, threshold: Watermark) -> Result<Vec<ProfileRecord>, ExtractError>;
}

/// A profile only becomes visible once all five of its rows exist.
const FETCH_SINCE_SQL: &str = r#"
SELECT c.customer_id, c.name, c.last_name, c.gender, c.date_of_birth,
       c.home_address, c.home_city, c.postal_code, c.country,
       c.iso_country_code, c.mobile_phone, c.email,
       r.favourite_color, r.favourite_category, r.favourite_subcategory,
       r.shirt_size, r.pants_size, r.shoe_size,
       m.consent, m.preferred_communication,
       l.loyalty_number_id, l.date_joined, l.points,
       s.profile_creation_date
  FROM customers c
  INNER JOIN retail_preferences r ON c.customer_id = r.customer_id
  INNER JOIN marketing_preferences m ON c.customer_id = m.customer_id
  INNER JOIN loyalty_data l ON c.customer_id = l.customer_id
  INNER JOIN system_data s ON c.customer_id = s.customer_id
 WHERE s.profile_creation_date > $1
 ORDER BY s.profile_creation_date, c.customer_id
"#;

#[derive(Debug, Clone)]
pub struct PgProfileSource {
    pool: PgPool,
}

impl PgProfileSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileSource for PgProfileSource {
    fn source_id(&self) -> &str {
        "postgres"
    }

    async fn fetch_since(&self, threshold: Watermark) -> Result<Vec<ProfileRecord>, ExtractError> {
        let rows = sqlx::query(FETCH_SINCE_SQL)
            .bind(threshold.as_naive())
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        debug!(%threshold, rows = rows.len(), "fetched profile rows");

        rows.iter()
            .map(profile_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_sqlx_error)
    }
}

fn profile_from_row(row: &PgRow) -> Result<ProfileRecord, sqlx::Error> {
    Ok(ProfileRecord {
        customer_id: row.try_get("customer_id")?,
        first_name: row.try_get("name")?,
        last_name: row.try_get("last_name")?,
        gender: row.try_get("gender")?,
        date_of_birth: row.try_get("date_of_birth")?,
        home_address: row.try_get("home_address")?,
        home_city: row.try_get("home_city")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        iso_country_code: row.try_get("iso_country_code")?,
        mobile_phone: row.try_get("mobile_phone")?,
        email: row.try_get("email")?,
        favourite_color: row.try_get("favourite_color")?,
        favourite_category: row.try_get("favourite_category")?,
        favourite_subcategory: row.try_get("favourite_subcategory")?,
        shirt_size: row.try_get("shirt_size")?,
        pants_size: row.try_get("pants_size")?,
        shoe_size: row.try_get("shoe_size")?,
        consent: row.try_get("consent")?,
        preferred_communication: row.try_get("preferred_communication")?,
        loyalty_number_id: row.try_get("loyalty_number_id")?,
        date_joined: row.try_get("date_joined")?,
        points: row.try_get("points")?,
        profile_creation_date: row.try_get("profile_creation_date")?,
    })
}

/// In-memory profile table, optionally seeded from a JSON fixture.
#[derive(Debug, Default)]
pub struct FixtureProfileSource {
    records: Mutex<Vec<ProfileRecord>>,
}

impl FixtureProfileSource {
    pub fn new(records: Vec<ProfileRecord>) -> Self {
        let mut deduped: Vec<ProfileRecord> = Vec::with_capacity(records.len());
        for record in records {
            if !deduped.iter().any(|r| r.customer_id == record.customer_id) {
                deduped.push(record);
            }
        }
        Self {
            records: Mutex::new(deduped),
        }
    }

    pub fn from_fixture(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_profile_fixture(path)?))
    }

    /// Insert a new profile; profiles are immutable, so a known customer id is ignored.
    pub async fn insert(&self, record: ProfileRecord) -> bool {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.customer_id == record.customer_id) {
            return false;
        }
        records.push(record);
        true
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl ProfileSource for FixtureProfileSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_since(&self, threshold: Watermark) -> Result<Vec<ProfileRecord>, ExtractError> {
        let records = self.records.lock().await;
        let mut newer: Vec<ProfileRecord> = records
            .iter()
            .filter(|r| r.watermark() > threshold)
            .cloned()
            .collect();
        newer.sort_by_key(|r| (r.profile_creation_date, r.customer_id));
        Ok(newer)
    }
}

/// Load a JSON array of [`ProfileRecord`]s.
pub fn load_profile_fixture(path: impl AsRef<Path>) -> Result<Vec<ProfileRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::path::PathBuf;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn record(customer_id: i32, created: NaiveDateTime) -> ProfileRecord {
        serde_json::from_value(serde_json::json!({
            "customer_id": customer_id,
            "profile_creation_date": created,
        }))
        .unwrap()
    }

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/profiles/sample.json")
    }

    #[tokio::test]
    async fn fetch_since_is_exclusive_and_ascending() {
        let source = FixtureProfileSource::new(vec![
            record(3, at(10, 0, 2)),
            record(1, at(10, 0, 0)),
            record(2, at(10, 0, 1)),
        ]);

        let all = source.fetch_since(Watermark::minimum()).await.unwrap();
        let ids: Vec<i32> = all.iter().map(|r| r.customer_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let after_first = source
            .fetch_since(Watermark::new(at(10, 0, 0)))
            .await
            .unwrap();
        let ids: Vec<i32> = after_first.iter().map(|r| r.customer_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn equal_timestamps_are_ordered_by_customer_id() {
        let source = FixtureProfileSource::new(vec![
            record(9, at(11, 0, 0)),
            record(4, at(11, 0, 0)),
        ]);
        let rows = source.fetch_since(Watermark::minimum()).await.unwrap();
        let ids: Vec<i32> = rows.iter().map(|r| r.customer_id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[tokio::test]
    async fn nothing_new_is_empty_not_error() {
        let source = FixtureProfileSource::new(vec![record(1, at(9, 0, 0))]);
        let rows = source.fetch_since(Watermark::new(at(9, 0, 0))).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn profiles_are_immutable_once_inserted() {
        let source = FixtureProfileSource::new(vec![record(1, at(9, 0, 0))]);
        assert!(!source.insert(record(1, at(12, 0, 0))).await);
        assert!(source.insert(record(2, at(12, 0, 0))).await);
        assert_eq!(source.len().await, 2);

        let rows = source.fetch_since(Watermark::minimum()).await.unwrap();
        assert_eq!(rows[0].profile_creation_date, at(9, 0, 0));
    }

    #[test]
    fn workspace_fixture_parses() {
        let records = load_profile_fixture(fixture_path()).expect("fixture");
        assert!(records.len() >= 3);
        assert!(records.iter().any(|r| r.date_of_birth.is_none()));
    }

    #[test]
    fn malformed_fixture_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_profile_fixture(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
