use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Service type assumed for operators that do not publish one.
pub const DEFAULT_SERVICE_TYPE: &str = "1";

/// Response envelope shared by both operator APIs. A `null` or missing
/// `data` field is not an error, it just means "nothing".
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub data: Option<T>,
}

impl<T: Default> Envelope<T> {
    pub fn into_data(self) -> T {
        self.data.unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteInfo {
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_tc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_sc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_tc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_sc: Option<String>,
}

/// One stop's position on a route in a given direction.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteStop {
    pub route: String,
    #[serde(rename = "dir", alias = "bound")]
    pub direction: String,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_type: Option<String>,
    #[serde(deserialize_with = "u32_from_string_or_number")]
    pub seq: u32,
    pub stop: String,
}

impl RouteStop {
    pub fn service_type(&self) -> &str {
        self.service_type.as_deref().unwrap_or(DEFAULT_SERVICE_TYPE)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StopDetail {
    pub stop: String,
    #[serde(default)]
    pub name_en: String,
    #[serde(default)]
    pub name_tc: String,
    #[serde(default)]
    pub name_sc: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub lat: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub long: String,
}

impl StopDetail {
    pub fn has_coordinates(&self) -> bool {
        !self.lat.is_empty() && !self.long.is_empty()
    }
}

/// Insertion-ordered set of route identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RouteSet(Vec<String>);

impl RouteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the route was already present.
    pub fn insert(&mut self, route: &str) -> bool {
        if self.contains(route) {
            return false;
        }
        self.0.push(route.to_string());
        true
    }

    pub fn contains(&self, route: &str) -> bool {
        self.0.iter().any(|r| r == route)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for RouteSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = RouteSet::new();
        for route in iter {
            set.insert(route.as_ref());
        }
        set
    }
}

/// Stop id to every route calling there.
pub type StopRoutesMap = BTreeMap<String, RouteSet>;

/// Direction code to service type to the ordered stop list.
pub type DirectionStops = BTreeMap<String, BTreeMap<String, Vec<RouteStop>>>;

pub type RouteStopsMap = BTreeMap<String, DirectionStops>;

/// Route number to every published variant of it.
pub type RouteMetadata = BTreeMap<String, Vec<RouteInfo>>;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EnrichedStop {
    #[serde(flatten)]
    pub detail: StopDetail,
    #[serde(default)]
    pub routes: RouteSet,
    #[serde(rename = "nearbyStopIDs", default)]
    pub nearby_stop_ids: Vec<String>,
    pub data_timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnrichedRouteStop {
    #[serde(flatten)]
    pub route_stop: RouteStop,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_en: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_tc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_sc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnrichedRoute {
    pub route: String,
    pub variants: Vec<RouteInfo>,
    pub stops: Vec<EnrichedRouteStop>,
    pub data_timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(d)?
        .map(String::from)
        .unwrap_or_default())
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(d)?.map(String::from))
}

fn u32_from_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let raw = String::from(StringOrNumber::deserialize(d)?);
    raw.trim()
        .parse()
        .map_err(|_| serde::de::Error::custom(format!("invalid sequence number: {raw}")))
}
