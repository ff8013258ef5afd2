//! Core domain model for relief feed ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relief-core";

/// Reporter name stamped on every record created by the ingestion engine.
pub const INGEST_REPORTER_NAME: &str = "Google Sheet Bot";

/// Substring embedded in ingested descriptions; matched case-insensitively.
pub const INGEST_MARKER: &str = "Google Sheet";

/// `0,0` means "not yet geocoded".
pub const SENTINEL_LATITUDE: f64 = 0.0;
pub const SENTINEL_LONGITUDE: f64 = 0.0;

pub const UNKNOWN_ADDRESS: &str = "Chưa rõ địa chỉ";
pub const UNKNOWN_NAME: &str = "Chưa rõ";
pub const UNKNOWN_PHONE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    SafeZone,
    EvacuationCenter,
    Hazard,
    FloodedArea,
    ResourcePoint,
    UserLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationStatus {
    Active,
    Inactive,
    Full,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersonStatus {
    Missing,
    Found,
    Deceased,
    NeedHelp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Unverified,
}

/// Text form shared by the JSON encoding and the database columns.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(LocationType {
    SafeZone => "SAFE_ZONE",
    EvacuationCenter => "EVACUATION_CENTER",
    Hazard => "HAZARD",
    FloodedArea => "FLOODED_AREA",
    ResourcePoint => "RESOURCE_POINT",
    UserLocation => "USER_LOCATION",
});

text_enum!(LocationStatus {
    Active => "ACTIVE",
    Inactive => "INACTIVE",
    Full => "FULL",
    Closed => "CLOSED",
});

text_enum!(Gender {
    Male => "MALE",
    Female => "FEMALE",
    Other => "OTHER",
    Unknown => "UNKNOWN",
});

text_enum!(PersonStatus {
    Missing => "MISSING",
    Found => "FOUND",
    Deceased => "DECEASED",
    NeedHelp => "NEED_HELP",
});

text_enum!(VerificationStatus {
    Pending => "PENDING",
    Verified => "VERIFIED",
    Unverified => "UNVERIFIED",
});

/// A physical place referenced by a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub province: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
    pub street: Option<String>,
    pub location_type: LocationType,
    pub description: Option<String>,
    pub reporter_name: Option<String>,
    pub status: LocationStatus,
    pub capacity: Option<i32>,
    pub current_count: Option<i32>,
    pub photo_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Location {
    pub fn awaiting_geocode(&self) -> bool {
        self.latitude == SENTINEL_LATITUDE && self.longitude == SENTINEL_LONGITUDE
    }
}

/// Creation payload for [`Location`]; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub province: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
    pub street: Option<String>,
    pub location_type: LocationType,
    pub description: Option<String>,
    pub reporter_name: Option<String>,
    pub status: LocationStatus,
    pub capacity: Option<i32>,
    pub current_count: Option<i32>,
    pub photo_urls: Vec<String>,
}

impl NewLocation {
    pub fn into_location(self, id: Uuid, now: DateTime<Utc>) -> Location {
        Location {
            id,
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address,
            province: self.province,
            district: self.district,
            ward: self.ward,
            street: self.street,
            location_type: self.location_type,
            description: self.description,
            reporter_name: self.reporter_name,
            status: self.status,
            capacity: self.capacity,
            current_count: self.current_count,
            photo_urls: self.photo_urls,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single missing-person or needs-help entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonReport {
    pub id: Uuid,
    pub reporter_name: String,
    pub reporter_phone: String,
    pub full_name: String,
    pub age: Option<u32>,
    pub gender: Gender,
    pub photo_urls: Vec<String>,
    pub description: String,
    /// Always set; every report owns exactly one last-known location.
    pub last_known_location: Uuid,
    pub last_seen_date: DateTime<Utc>,
    pub contact_info: String,
    pub status: PersonStatus,
    pub found_date: Option<DateTime<Utc>>,
    pub verification_status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPersonReport {
    pub reporter_name: String,
    pub reporter_phone: String,
    pub full_name: String,
    pub age: Option<u32>,
    pub gender: Gender,
    pub photo_urls: Vec<String>,
    pub description: String,
    pub last_known_location: Uuid,
    pub last_seen_date: DateTime<Utc>,
    pub contact_info: String,
    pub status: PersonStatus,
    pub found_date: Option<DateTime<Utc>>,
    pub verification_status: VerificationStatus,
}

impl NewPersonReport {
    pub fn into_report(self, id: Uuid, now: DateTime<Utc>) -> PersonReport {
        PersonReport {
            id,
            reporter_name: self.reporter_name,
            reporter_phone: self.reporter_phone,
            full_name: self.full_name,
            age: self.age,
            gender: self.gender,
            photo_urls: self.photo_urls,
            description: self.description,
            last_known_location: self.last_known_location,
            last_seen_date: self.last_seen_date,
            contact_info: self.contact_info,
            status: self.status,
            found_date: self.found_date,
            verification_status: self.verification_status,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Normalized handoff contract from field extraction into the sync pipeline.
///
/// Empty strings mean "not present in the row"; `description` is the composite
/// text that gets stored, never the raw note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub line: u64,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub status_text: String,
    pub area: String,
    pub people_count: String,
    pub note: String,
    pub description: String,
}

impl CandidateRecord {
    /// Address the materialized location will carry: address, then area, then placeholder.
    pub fn location_address(&self) -> &str {
        if !self.address.is_empty() {
            &self.address
        } else if !self.area.is_empty() {
            &self.area
        } else {
            UNKNOWN_ADDRESS
        }
    }
}

/// True when `description` carries the ingestion marker.
pub fn has_ingest_marker(description: &str) -> bool {
    description
        .to_lowercase()
        .contains(&INGEST_MARKER.to_lowercase())
}
