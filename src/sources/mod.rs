pub mod ctb;
pub mod kmb;

use serde_json::Value;
use tracing::warn;

use crate::{
    batch::{Progress, process_with_concurrency},
    error::{Error, NetworkError, Result},
    fetch::{FetchClient, FetchProfile},
    model::{Envelope, RouteInfo, RouteStop, StopDetail, StopRoutesMap},
};

pub use ctb::CtbSource;
pub use kmb::KmbSource;

/// A direction as it appears in request URLs (`leg`) and in records (`code`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Direction {
    pub leg: &'static str,
    pub code: &'static str,
}

pub const INBOUND: Direction = Direction {
    leg: "inbound",
    code: "I",
};

pub const OUTBOUND: Direction = Direction {
    leg: "outbound",
    code: "O",
};

/// What differs between operators, expressed as data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceProfile {
    /// Output subdirectory and log label.
    pub name: &'static str,
    pub company: &'static str,
    pub directions: &'static [Direction],
    /// Whether a route number is split further by `service_type`.
    pub multi_service: bool,
}

/// Route-stop associations collected for one route. A failed direction leaves
/// its stops out and records the failure; the other direction is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteStopFetch {
    pub route: String,
    pub stops: Vec<RouteStop>,
    pub failures: Vec<NetworkError>,
}

impl RouteStopFetch {
    pub fn has_error(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of looking up one stop. `Ok(None)` is an empty payload.
#[derive(Clone, Debug, PartialEq)]
pub struct StopFetch {
    pub stop_id: String,
    pub result: std::result::Result<Option<StopDetail>, NetworkError>,
    /// Taken from the previously published snapshot instead of fetched.
    pub reused: bool,
}

impl StopFetch {
    pub fn fetched(stop_id: impl Into<String>, detail: StopDetail) -> Self {
        Self {
            stop_id: stop_id.into(),
            result: Ok(Some(detail)),
            reused: false,
        }
    }

    pub fn failed(stop_id: impl Into<String>, error: NetworkError) -> Self {
        Self {
            stop_id: stop_id.into(),
            result: Err(error),
            reused: false,
        }
    }
}

/// One operator's endpoints and collection strategy.
#[allow(async_fn_in_trait)]
pub trait BusSource {
    fn profile(&self) -> &SourceProfile;

    /// Returns every route variant from the routes listing.
    async fn collect_routes(&self) -> Result<Vec<RouteInfo>>;

    /// Returns one entry per route that has any associations. Per-direction
    /// failures are recorded inside the entries.
    async fn collect_route_stops(&self, routes: &[RouteInfo]) -> Result<Vec<RouteStopFetch>>;

    /// Returns one entry per requested stop, in request order.
    async fn collect_stop_details(
        &self,
        stop_ids: &[String],
        stop_routes: &StopRoutesMap,
    ) -> Vec<StopFetch>;
}

/// Looks up `{base_url}/stop/{stop_id}`. Failures are returned, not raised.
pub(crate) async fn fetch_stop_detail(
    client: &FetchClient,
    base_url: &str,
    stop_id: String,
) -> StopFetch {
    let url = format!("{base_url}/stop/{stop_id}");
    let result = match client.fetch_json(&url, FetchProfile::Small).await {
        Ok(value) => {
            decode_stop(&url, value).map_err(|e| NetworkError::new(&url, e.to_string(), None))
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        warn!(stop = %stop_id, error = %e, "stop request failed");
    }

    StopFetch {
        stop_id,
        result,
        reused: false,
    }
}

/// [`fetch_stop_detail`] for every id, in batches of `concurrency`.
pub(crate) async fn fetch_stop_details(
    client: &FetchClient,
    base_url: &str,
    label: &str,
    concurrency: usize,
    stop_ids: &[String],
) -> Vec<StopFetch> {
    let progress = Progress::new(label, stop_ids.len());
    process_with_concurrency(
        stop_ids.iter().cloned(),
        concurrency,
        Some(&progress),
        |stop_id| fetch_stop_detail(client, base_url, stop_id),
    )
    .await
}

/// Unwraps the `{data: ...}` envelope, treating a missing payload as empty.
pub(crate) fn decode_data<T>(url: &str, value: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    serde_json::from_value::<Envelope<T>>(value)
        .map(Envelope::into_data)
        .map_err(|e| Error::Validation(format!("{url}: {e}")))
}

/// Unwraps a single stop record. `null`, a missing field and `{}` all mean
/// the operator has nothing for this id.
pub(crate) fn decode_stop(url: &str, value: Value) -> Result<Option<StopDetail>> {
    let data = decode_data::<Option<Value>>(url, value)?;
    match data {
        None => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(record) => serde_json::from_value(record)
            .map(Some)
            .map_err(|e| Error::Validation(format!("{url}: {e}"))),
    }
}
