use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use itertools::Itertools;
use tracing::{info, warn};

use crate::{
    config::Config,
    error::Result,
    fetch::{FetchClient, FetchProfile},
    model::{RouteInfo, RouteStop, StopDetail, StopRoutesMap},
    sources::{
        BusSource, INBOUND, OUTBOUND, RouteStopFetch, SourceProfile, StopFetch, decode_data,
        fetch_stop_detail, fetch_stop_details,
    },
};

pub const KMB_PROFILE: SourceProfile = SourceProfile {
    name: "kmb",
    company: "KMB",
    directions: &[INBOUND, OUTBOUND],
    multi_service: true,
};

/// KMB: bulk route-stop and stop listings, with per-stop lookups for
/// anything the bulk listing misses.
pub struct KmbSource {
    client: Arc<FetchClient>,
    base_url: String,
    concurrency: usize,
}

impl KmbSource {
    pub fn new(client: Arc<FetchClient>, config: &Config) -> Self {
        Self {
            client,
            base_url: config.kmb_base_url.clone(),
            concurrency: config.concurrency,
        }
    }

    fn routes_url(&self) -> String {
        format!("{}/route/", self.base_url)
    }

    fn route_stops_url(&self) -> String {
        format!("{}/route-stop", self.base_url)
    }

    fn stops_url(&self) -> String {
        format!("{}/stop", self.base_url)
    }

    /// One bulk request for every route, grouped by route number here.
    pub async fn collect_all_route_stops_data(&self) -> Result<Vec<RouteStopFetch>> {
        let url = self.route_stops_url();
        let value = self.client.fetch_json(&url, FetchProfile::Large).await?;
        let stops: Vec<RouteStop> = decode_data(&url, value)?;
        info!(associations = stops.len(), "fetched kmb route-stop listing");

        Ok(group_route_stops(stops))
    }

    pub async fn collect_stop_detail(&self, stop_id: String) -> StopFetch {
        fetch_stop_detail(&self.client, &self.base_url, stop_id).await
    }

    pub async fn collect_all_stop_details(&self, stop_ids: &[String]) -> Vec<StopFetch> {
        fetch_stop_details(
            &self.client,
            &self.base_url,
            "kmb stops",
            self.concurrency,
            stop_ids,
        )
        .await
    }

    async fn fetch_stop_listing(&self) -> Result<BTreeMap<String, StopDetail>> {
        let url = self.stops_url();
        let value = self.client.fetch_json(&url, FetchProfile::Large).await?;
        let stops: Vec<StopDetail> = decode_data(&url, value)?;
        Ok(stops.into_iter().map(|s| (s.stop.clone(), s)).collect())
    }

    /// Answers from the bulk stop listing where possible; stops missing from
    /// it, or every stop if the listing fails, are looked up one by one.
    pub async fn collect_stop_details_for_stops(&self, stop_ids: &[String]) -> Vec<StopFetch> {
        let mut listing = match self.fetch_stop_listing().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "kmb stop listing unavailable, fetching stops individually");
                return self.collect_all_stop_details(stop_ids).await;
            }
        };

        let (found, missing): (Vec<_>, Vec<_>) = stop_ids
            .iter()
            .partition(|id| listing.contains_key(id.as_str()));
        info!(
            listed = found.len(),
            missing = missing.len(),
            "matched stops against kmb stop listing"
        );

        let missing: Vec<String> = missing.into_iter().cloned().collect();
        let mut looked_up: BTreeMap<String, StopFetch> = self
            .collect_all_stop_details(&missing)
            .await
            .into_iter()
            .map(|f| (f.stop_id.clone(), f))
            .collect();

        stop_ids
            .iter()
            .filter_map(|id| match listing.remove(id) {
                Some(detail) => Some(StopFetch::fetched(id.clone(), detail)),
                None => looked_up.remove(id),
            })
            .collect()
    }
}

/// Splits a bulk listing into one entry per route, keeping listing order.
fn group_route_stops(stops: Vec<RouteStop>) -> Vec<RouteStopFetch> {
    stops
        .into_iter()
        .into_group_map_by(|s| s.route.clone())
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(route, stops)| RouteStopFetch {
            route,
            stops,
            failures: Vec::new(),
        })
        .collect()
}

impl BusSource for KmbSource {
    fn profile(&self) -> &SourceProfile {
        &KMB_PROFILE
    }

    async fn collect_routes(&self) -> Result<Vec<RouteInfo>> {
        let url = self.routes_url();
        let value = self.client.fetch_json(&url, FetchProfile::Small).await?;
        decode_data(&url, value)
    }

    /// The bulk listing covers every route, so `routes` only narrows it down
    /// to routes that are currently listed.
    async fn collect_route_stops(&self, routes: &[RouteInfo]) -> Result<Vec<RouteStopFetch>> {
        let listed: HashSet<&str> = routes.iter().map(|r| r.route.as_str()).collect();
        let all = self.collect_all_route_stops_data().await?;
        let (kept, dropped): (Vec<_>, Vec<_>) = all
            .into_iter()
            .partition(|r| listed.contains(r.route.as_str()));

        if !dropped.is_empty() {
            warn!(
                routes = dropped.len(),
                "route-stop listing mentions routes missing from the route listing"
            );
        }

        Ok(kept)
    }

    async fn collect_stop_details(
        &self,
        stop_ids: &[String],
        _stop_routes: &StopRoutesMap,
    ) -> Vec<StopFetch> {
        self.collect_stop_details_for_stops(stop_ids).await
    }
}
