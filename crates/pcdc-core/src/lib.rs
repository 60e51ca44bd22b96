//! Core domain model, error kinds and the profile-to-document transform for PCDC.

use std::fmt;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pcdc-core";

/// Highest profile creation timestamp that has been fully processed.
///
/// Stored as a timestamp without time zone, matching the `watermark` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(NaiveDateTime);

impl Watermark {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(at)
    }

    /// Provisioning default: `0001-01-01 00:00:00`.
    pub fn minimum() -> Self {
        let day = NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN);
        Self(day.and_time(NaiveTime::MIN))
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }
}

impl From<NaiveDateTime> for Watermark {
    fn from(at: NaiveDateTime) -> Self {
        Self(at)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&iso_datetime(self.0))
    }
}

/// Denormalized customer profile joined from the five profile tables.
///
/// Only the customer id and creation timestamp are guaranteed; everything
/// else mirrors a nullable column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub customer_id: i32,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub home_address: Option<String>,
    #[serde(default)]
    pub home_city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub iso_country_code: Option<String>,
    #[serde(default)]
    pub mobile_phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub favourite_color: Option<String>,
    #[serde(default)]
    pub favourite_category: Option<String>,
    #[serde(default)]
    pub favourite_subcategory: Option<String>,
    #[serde(default)]
    pub shirt_size: Option<String>,
    #[serde(default)]
    pub pants_size: Option<String>,
    #[serde(default)]
    pub shoe_size: Option<i32>,
    #[serde(default)]
    pub consent: Option<bool>,
    #[serde(default)]
    pub preferred_communication: Option<String>,
    #[serde(default)]
    pub loyalty_number_id: Option<i64>,
    #[serde(default)]
    pub date_joined: Option<NaiveDate>,
    #[serde(default)]
    pub points: Option<i32>,
    pub profile_creation_date: NaiveDateTime,
}

impl ProfileRecord {
    /// Cursor position this record moves the watermark to once processed.
    pub fn watermark(&self) -> Watermark {
        Watermark(self.profile_creation_date)
    }
}

/// Nested event document emitted to the sink, one per [`ProfileRecord`].
///
/// Field order and key names follow the downstream profile schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDocument {
    pub create_date: Option<String>,
    pub identification: Identification,
    pub individual_characteristics: IndividualCharacteristics,
    pub user_account: UserAccount,
    pub loyalty: Loyalty,
    pub consents: Consents,
    pub home_address: HomeAddress,
    pub mobile_phone: MobilePhone,
    pub person: Person,
    pub personal_email: PersonalEmail,
    pub test_profile: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub customer_id: i32,
    pub email: Option<String>,
    pub loyalty_id: Option<i64>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualCharacteristics {
    pub core: CoreCharacteristics,
    pub retail: RetailCharacteristics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreCharacteristics {
    pub age: Option<i32>,
    pub favourite_category: Option<String>,
    pub favourite_sub_category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetailCharacteristics {
    pub favorite_color: Option<String>,
    pub pants_size: Option<String>,
    pub shirt_size: Option<String>,
    pub shoe_size: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    #[serde(rename = "ID")]
    pub id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loyalty {
    #[serde(rename = "loyaltyID")]
    pub loyalty_id: Option<i64>,
    #[serde(rename = "joinDate")]
    pub join_date: Option<String>,
    pub points: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consents {
    pub collect: ConsentCollect,
    pub marketing: ConsentMarketing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentCollect {
    pub val: ConsentFlag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentMarketing {
    pub preferred: Option<String>,
}

/// Single-character consent marker: `"y"` or `"n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentFlag {
    #[serde(rename = "y")]
    Yes,
    #[serde(rename = "n")]
    No,
}

impl ConsentFlag {
    /// Absent consent is treated as withheld.
    pub fn from_consent(consent: Option<bool>) -> Self {
        if consent.unwrap_or(false) {
            Self::Yes
        } else {
            Self::No
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeAddress {
    pub city: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub street1: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobilePhone {
    pub number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub birth_day_and_month: Option<String>,
    pub birth_year: Option<i32>,
    pub name: PersonName,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    pub last_name: Option<String>,
    pub full_name: String,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalEmail {
    pub address: Option<String>,
}

/// Map one profile row into its output document.
///
/// `reference_year` drives the `age` field and is taken from the caller's
/// clock so the mapping stays deterministic. Age is a plain year difference
/// and ignores whether the birthday has already passed.
pub fn transform(record: &ProfileRecord, reference_year: i32) -> OutputDocument {
    let birth = record.date_of_birth;

    OutputDocument {
        create_date: Some(iso_datetime(record.profile_creation_date)),
        identification: Identification {
            customer_id: record.customer_id,
            email: record.email.clone(),
            loyalty_id: record.loyalty_number_id,
            phone_number: record.mobile_phone.clone(),
        },
        individual_characteristics: IndividualCharacteristics {
            core: CoreCharacteristics {
                age: birth.map(|d| reference_year - d.year()),
                favourite_category: record.favourite_category.clone(),
                favourite_sub_category: record.favourite_subcategory.clone(),
            },
            retail: RetailCharacteristics {
                favorite_color: record.favourite_color.clone(),
                pants_size: record.pants_size.clone(),
                shirt_size: record.shirt_size.clone(),
                shoe_size: record.shoe_size,
            },
        },
        user_account: UserAccount {
            id: record.customer_id,
        },
        loyalty: Loyalty {
            loyalty_id: record.loyalty_number_id,
            join_date: record.date_joined.map(iso_date),
            points: record.points,
        },
        consents: Consents {
            collect: ConsentCollect {
                val: ConsentFlag::from_consent(record.consent),
            },
            marketing: ConsentMarketing {
                preferred: record.preferred_communication.clone(),
            },
        },
        home_address: HomeAddress {
            city: record.home_city.clone(),
            country: record.country.clone(),
            country_code: record.iso_country_code.clone(),
            street1: record.home_address.clone(),
            postal_code: record.postal_code.clone(),
        },
        mobile_phone: MobilePhone {
            number: record.mobile_phone.clone(),
        },
        person: Person {
            birth_day_and_month: birth.map(|d| d.format("%m-%d").to_string()),
            birth_year: birth.map(|d| d.year()),
            name: PersonName {
                last_name: record.last_name.clone(),
                full_name: full_name(record.first_name.as_deref(), record.last_name.as_deref()),
                first_name: record.first_name.clone(),
            },
            gender: record.gender.clone(),
        },
        personal_email: PersonalEmail {
            address: record.email.clone(),
        },
        test_profile: true,
    }
}

/// Always `"{first} {last}"`, so a missing part leaves a stray space.
fn full_name(first: Option<&str>, last: Option<&str>) -> String {
    format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default())
}

/// ISO-8601 without offset; fractional seconds only when present, as microseconds.
pub fn iso_datetime(at: NaiveDateTime) -> String {
    if at.nanosecond() == 0 {
        at.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Failures surfaced by sources, watermark stores and sinks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("watermark is not initialized; provision the store before extracting")]
    NotInitialized,
    #[error("sink {sink} failed: {message}")]
    Sink { sink: String, message: String },
    #[error("sink {sink} rejected batch: {message}")]
    SinkRejected { sink: String, message: String },
}

impl ExtractError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Connectivity(_) | Self::Query(_) | Self::Timeout { .. } | Self::Sink { .. } => {
                RetryDisposition::Retryable
            }
            Self::NotInitialized | Self::SinkRejected { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}
