use std::{collections::BTreeMap, sync::Arc};

use itertools::Itertools;
use tracing::{info, warn};

use crate::{
    batch::{Progress, process_with_concurrency},
    config::Config,
    error::{NetworkError, Result},
    fetch::{FetchClient, FetchProfile},
    model::{EnrichedStop, RouteInfo, RouteStop, StopRoutesMap},
    processor::{compare_routes, fallback_stop},
    sources::{
        BusSource, INBOUND, OUTBOUND, RouteStopFetch, SourceProfile, StopFetch, decode_data,
        fetch_stop_detail, fetch_stop_details,
    },
};

pub const CTB_PROFILE: SourceProfile = SourceProfile {
    name: "ctb",
    company: "CTB",
    directions: &[INBOUND, OUTBOUND],
    multi_service: false,
};

/// Citybus: per-route, per-direction route-stop lookups and per-stop details,
/// optionally skipping stops whose routes match the last published snapshot.
pub struct CtbSource {
    client: Arc<FetchClient>,
    base_url: String,
    published_stops_url: Option<String>,
    concurrency: usize,
}

impl CtbSource {
    pub fn new(client: Arc<FetchClient>, config: &Config) -> Self {
        Self {
            client,
            base_url: config.ctb_base_url.clone(),
            published_stops_url: config.ctb_published_stops_url.clone(),
            concurrency: config.concurrency,
        }
    }

    fn routes_url(&self) -> String {
        format!("{}/route/{}", self.base_url, CTB_PROFILE.company)
    }

    fn route_stop_url(&self, route: &str, leg: &str) -> String {
        format!(
            "{}/route-stop/{}/{route}/{leg}",
            self.base_url, CTB_PROFILE.company
        )
    }

    /// Both directions of one route, requested together. A failing direction
    /// only loses its own stops.
    pub async fn collect_route_stop(&self, route: &str) -> RouteStopFetch {
        let (inbound, outbound) = futures::join!(
            self.collect_direction(route, INBOUND.leg),
            self.collect_direction(route, OUTBOUND.leg)
        );

        let mut fetch = RouteStopFetch {
            route: route.to_string(),
            stops: Vec::new(),
            failures: Vec::new(),
        };
        for leg in [inbound, outbound] {
            match leg {
                Ok(stops) => fetch.stops.extend(stops),
                Err(e) => {
                    warn!(route, error = %e, "route-stop request failed");
                    fetch.failures.push(e);
                }
            }
        }
        fetch
    }

    async fn collect_direction(
        &self,
        route: &str,
        leg: &str,
    ) -> std::result::Result<Vec<RouteStop>, NetworkError> {
        let url = self.route_stop_url(route, leg);
        let value = self.client.fetch_json(&url, FetchProfile::Small).await?;
        decode_data(&url, value).map_err(|e| NetworkError::new(&url, e.to_string(), None))
    }

    pub async fn collect_stop_detail(&self, stop_id: String) -> StopFetch {
        fetch_stop_detail(&self.client, &self.base_url, stop_id).await
    }

    pub async fn collect_all_stop_details(&self, stop_ids: &[String]) -> Vec<StopFetch> {
        fetch_stop_details(
            &self.client,
            &self.base_url,
            "ctb stops",
            self.concurrency,
            stop_ids,
        )
        .await
    }

    async fn fetch_published_stops(&self, url: &str) -> Result<BTreeMap<String, EnrichedStop>> {
        let value = self.client.fetch_json_fresh(url, FetchProfile::Large).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Reuses the published record of every stop whose route set is unchanged
    /// and fetches the rest.
    ///
    /// A stop renamed or moved without a route change keeps its old details
    /// until its routes change. Placeholders written for failed lookups are
    /// never reused.
    pub async fn collect_optimized_stop_details(
        &self,
        stop_ids: &[String],
        stop_routes: &StopRoutesMap,
    ) -> Vec<StopFetch> {
        let Some(url) = &self.published_stops_url else {
            return self.collect_all_stop_details(stop_ids).await;
        };

        let previous = match self.fetch_published_stops(url).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(url = %url, error = %e, "published stops unavailable, fetching every stop");
                return self.collect_all_stop_details(stop_ids).await;
            }
        };

        let mut reused: BTreeMap<&str, StopFetch> = BTreeMap::new();
        let mut to_fetch = Vec::new();
        for stop_id in stop_ids {
            let unchanged = previous.get(stop_id).filter(|p| {
                is_reusable(stop_id, p)
                    && compare_routes(
                        Some(p.routes.as_slice()),
                        stop_routes.get(stop_id).map(|r| r.as_slice()),
                    )
            });
            match unchanged {
                Some(p) => {
                    reused.insert(
                        stop_id.as_str(),
                        StopFetch {
                            stop_id: stop_id.clone(),
                            result: Ok(Some(p.detail.clone())),
                            reused: true,
                        },
                    );
                }
                None => to_fetch.push(stop_id.clone()),
            }
        }

        info!(
            reused = reused.len(),
            to_fetch = to_fetch.len(),
            "compared stops against published snapshot"
        );

        let mut fetched: BTreeMap<String, StopFetch> = self
            .collect_all_stop_details(&to_fetch)
            .await
            .into_iter()
            .map(|f| (f.stop_id.clone(), f))
            .collect();

        stop_ids
            .iter()
            .filter_map(|id| reused.remove(id.as_str()).or_else(|| fetched.remove(id)))
            .collect()
    }
}

/// A published record is only worth reusing if it came from a real lookup.
fn is_reusable(stop_id: &str, previous: &EnrichedStop) -> bool {
    previous.detail.has_coordinates() && previous.detail != fallback_stop(stop_id)
}

impl BusSource for CtbSource {
    fn profile(&self) -> &SourceProfile {
        &CTB_PROFILE
    }

    async fn collect_routes(&self) -> Result<Vec<RouteInfo>> {
        let url = self.routes_url();
        let value = self.client.fetch_json(&url, FetchProfile::Small).await?;
        decode_data(&url, value)
    }

    async fn collect_route_stops(&self, routes: &[RouteInfo]) -> Result<Vec<RouteStopFetch>> {
        let route_ids: Vec<String> = routes.iter().map(|r| r.route.clone()).unique().collect();

        let progress = Progress::new("ctb route-stops", route_ids.len());
        let results = process_with_concurrency(
            route_ids,
            self.concurrency,
            Some(&progress),
            |route| async move { self.collect_route_stop(&route).await },
        )
        .await;

        Ok(results)
    }

    async fn collect_stop_details(
        &self,
        stop_ids: &[String],
        stop_routes: &StopRoutesMap,
    ) -> Vec<StopFetch> {
        self.collect_optimized_stop_details(stop_ids, stop_routes).await
    }
}
