//! Core dealer model shared by the ingestion pipeline, the store and the query API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealerscope-core";

/// Mean earth radius used for spherical-cap radius queries.
pub const EARTH_RADIUS_KM: f64 = 6378.1;

/// Manufacturer whose dealer locator is scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Kia,
    Opel,
    Seat,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Kia, Source::Opel, Source::Seat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Kia => "kia",
            Source::Opel => "opel",
            Source::Seat => "seat",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dealer source `{}`", self.0)
    }
}

impl std::error::Error for UnknownSource {}

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownSource(needle.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }

    pub fn within_radius(&self, center: &Coordinates, radius_km: f64) -> bool {
        self.distance_km(center) <= radius_km
    }
}

/// GeoJSON point, `[longitude, latitude]` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    pub kind: GeoPointKind,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoPointKind {
    Point,
}

impl From<Coordinates> for GeoPoint {
    fn from(c: Coordinates) -> Self {
        Self {
            kind: GeoPointKind::Point,
            coordinates: [c.longitude, c.latitude],
        }
    }
}

/// Unvalidated dealer fields as read off a locator page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDealerTuple {
    pub name: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    /// Combined "PLZ City" line for sites that render both together.
    pub postal_code_city: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub services: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

fn non_blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl RawDealerTuple {
    /// True when at least one identifying or contact field carries text.
    pub fn has_content(&self) -> bool {
        non_blank(&self.name)
            || non_blank(&self.street)
            || non_blank(&self.postal_code)
            || non_blank(&self.city)
            || non_blank(&self.postal_code_city)
            || non_blank(&self.phone)
            || non_blank(&self.website)
    }
}

/// Collapses whitespace runs and lower-cases; used for identity comparison only.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Splits `"66111 Saarbrücken"` into postal code and city on the first whitespace run.
pub fn split_postal_city(input: &str) -> (String, String) {
    let trimmed = input.trim();
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (
            trimmed[..idx].to_string(),
            trimmed[idx..].split_whitespace().collect::<Vec<_>>().join(" "),
        ),
        None => (trimmed.to_string(), String::new()),
    }
}

/// Normalized identity of a dealer within one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealerKey {
    pub name: String,
    pub street: String,
    pub postal_code: String,
}

impl DealerKey {
    pub fn new(name: &str, street: &str, postal_code: &str) -> Self {
        Self {
            name: normalize_key_fragment(name),
            street: normalize_key_fragment(street),
            postal_code: postal_code.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

impl fmt::Display for DealerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.name, self.street, self.postal_code)
    }
}

/// One dealership as known to one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", into = "DealerRecordWire")]
pub struct DealerRecord {
    pub source: Source,
    pub name: String,
    pub street: String,
    pub postal_code: String,
    pub city: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub inactive: bool,
}

impl DealerRecord {
    pub fn new(
        source: Source,
        name: impl Into<String>,
        street: impl Into<String>,
        postal_code: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            source,
            name: name.into(),
            street: street.into(),
            postal_code: postal_code.into(),
            city: city.into(),
            phone: None,
            email: None,
            website: None,
            services: Vec::new(),
            latitude: None,
            longitude: None,
            inactive: false,
        }
    }

    pub fn key(&self) -> DealerKey {
        DealerKey::new(&self.name, &self.street, &self.postal_code)
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        }
    }

    pub fn set_coordinates(&mut self, coordinates: Option<Coordinates>) {
        self.latitude = coordinates.map(|c| c.latitude);
        self.longitude = coordinates.map(|c| c.longitude);
    }

    /// Derived point; present iff both latitude and longitude are.
    pub fn location(&self) -> Option<GeoPoint> {
        self.coordinates().map(GeoPoint::from)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DealerRecordWire {
    source: Source,
    name: String,
    street: String,
    postal_code: String,
    city: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    website: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
    inactive: bool,
}

impl From<DealerRecord> for DealerRecordWire {
    fn from(record: DealerRecord) -> Self {
        let location = record.location();
        Self {
            source: record.source,
            name: record.name,
            street: record.street,
            postal_code: record.postal_code,
            city: record.city,
            phone: record.phone,
            email: record.email,
            website: record.website,
            services: record.services,
            latitude: record.latitude,
            longitude: record.longitude,
            location,
            inactive: record.inactive,
        }
    }
}

/// Last completed run per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRunState {
    pub source: Source,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postal_city_splits_on_first_whitespace_run() {
        assert_eq!(
            split_postal_city("66111 Saarbrücken"),
            ("66111".to_string(), "Saarbrücken".to_string())
        );
        assert_eq!(
            split_postal_city("  10115   Berlin  Mitte "),
            ("10115".to_string(), "Berlin Mitte".to_string())
        );
        assert_eq!(split_postal_city("10115"), ("10115".to_string(), String::new()));
        assert_eq!(split_postal_city("   "), (String::new(), String::new()));
    }

    #[test]
    fn dealer_key_ignores_case_and_whitespace() {
        let a = DealerKey::new("  Autohaus  MÜLLER ", "Hauptstr. 1", " 66111 ");
        let b = DealerKey::new("autohaus müller", "hauptstr.  1", "66111");
        assert_eq!(a, b);
        assert_eq!(a.name, "autohaus müller");
    }

    #[test]
    fn raw_tuple_without_text_has_no_content() {
        let blank = RawDealerTuple {
            name: Some("   ".into()),
            email: Some("info@example.de".into()),
            services: vec!["Service".into()],
            ..Default::default()
        };
        assert!(!blank.has_content());

        let combined = RawDealerTuple {
            postal_code_city: Some("66111 Saarbrücken".into()),
            ..Default::default()
        };
        assert!(combined.has_content());
    }

    #[test]
    fn location_is_serialized_only_with_both_coordinates() {
        let mut record = DealerRecord::new(Source::Kia, "A", "B", "66111", "Saarbrücken");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("location").is_none());
        assert_eq!(json["postalCode"], "66111");
        assert_eq!(json["source"], "kia");

        record.latitude = Some(49.23);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("location").is_none());

        record.set_coordinates(Some(Coordinates::new(49.23, 7.0)));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["location"]["type"], "Point");
        assert_eq!(json["location"]["coordinates"][0], 7.0);
        assert_eq!(json["location"]["coordinates"][1], 49.23);

        let back: DealerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn source_parses_case_insensitively() {
        assert_eq!("Kia".parse::<Source>().unwrap(), Source::Kia);
        assert_eq!(" OPEL ".parse::<Source>().unwrap(), Source::Opel);
        assert!("vw".parse::<Source>().is_err());
    }

    #[test]
    fn spherical_distance_matches_known_pair() {
        let saarbruecken = Coordinates::new(49.2354, 6.9965);
        let homburg = Coordinates::new(49.3270, 7.3386);
        let d = saarbruecken.distance_km(&homburg);
        assert!((25.0..28.0).contains(&d), "distance was {d}");
        assert!(saarbruecken.within_radius(&saarbruecken, 0.0));
        assert!(!homburg.within_radius(&saarbruecken, 5.0));
    }
}
