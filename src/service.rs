use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    fetch::FetchClient,
    model::EnrichedStop,
    output::{ALL_ROUTES_FILE, ALL_STOPS_FILE, FileManager, colliding_ids},
    processor::{
        assign_nearby_stops, build_route_metadata, create_enriched_route_data,
        enrich_stop_with_routes, fallback_stop, process_route_stop_results,
        process_stop_details_results,
    },
    sources::{BusSource, CtbSource, KmbSource},
};

/// Counts reported at the end of one operator's run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub source: &'static str,
    pub routes: usize,
    pub stops_total: usize,
    pub stops_fetched: usize,
    pub stops_reused: usize,
    pub stop_errors: usize,
    pub route_stop_errors: usize,
    pub save_errors: usize,
    pub elapsed: Duration,
}

/// Drives the collect, process and publish pipeline for each operator.
pub struct Service {
    config: Config,
    client: Arc<FetchClient>,
}

impl Service {
    pub fn new(config: Config, client: Arc<FetchClient>) -> Self {
        Self { config, client }
    }

    pub fn ctb(&self) -> CtbSource {
        CtbSource::new(self.client.clone(), &self.config)
    }

    pub fn kmb(&self) -> KmbSource {
        KmbSource::new(self.client.clone(), &self.config)
    }

    /// Runs the whole pipeline for one operator.
    ///
    /// Only an unusable route listing, an unusable route-stop listing or an
    /// uncreatable output directory end the run early; every other failure
    /// is counted and logged.
    pub async fn run<S: BusSource>(&self, source: &S) -> Result<RunSummary> {
        let started = Instant::now();
        let profile = source.profile();
        let mut summary = RunSummary {
            source: profile.name,
            ..Default::default()
        };
        info!(source = profile.name, "starting collection");

        let routes = source
            .collect_routes()
            .await
            .map_err(|e| Error::processing("collecting routes", e))?;
        if routes.is_empty() {
            return Err(Error::processing(
                "collecting routes",
                Error::Validation("route listing is empty".to_string()),
            ));
        }
        let metadata = build_route_metadata(&routes);
        summary.routes = metadata.len();
        info!(source = profile.name, variants = routes.len(), routes = metadata.len(), "collected routes");

        let route_stop_results = source
            .collect_route_stops(&routes)
            .await
            .map_err(|e| Error::processing("collecting route-stops", e))?;
        summary.route_stop_errors = route_stop_results.iter().map(|r| r.failures.len()).sum();
        let (route_stops, stop_routes) = process_route_stop_results(&route_stop_results, profile);

        let stop_ids: Vec<String> = stop_routes.keys().cloned().collect();
        summary.stops_total = stop_ids.len();
        info!(source = profile.name, stops = stop_ids.len(), "collecting stop details");

        let stop_results = source.collect_stop_details(&stop_ids, &stop_routes).await;
        summary.stops_reused = stop_results.iter().filter(|r| r.reused).count();
        summary.stops_fetched = stop_results
            .iter()
            .filter(|r| !r.reused && matches!(r.result, Ok(Some(_))))
            .count();
        let details = process_stop_details_results(stop_results);

        let mut stops: BTreeMap<String, EnrichedStop> = BTreeMap::new();
        for stop_id in &stop_ids {
            let detail = match details.get(stop_id) {
                Some(detail) => detail.clone(),
                None => {
                    summary.stop_errors += 1;
                    fallback_stop(stop_id)
                }
            };
            stops.insert(
                stop_id.clone(),
                enrich_stop_with_routes(detail, &stop_routes, stop_id),
            );
        }
        assign_nearby_stops(&mut stops);

        let files = FileManager::new(&self.config.output_dir, profile);
        files
            .ensure_directories()
            .await
            .map_err(|e| Error::processing("preparing output directories", e))?;

        let stop_collisions = colliding_ids(stops.keys().map(String::as_str), ALL_STOPS_FILE);
        for (stop_id, stop) in &stops {
            if stop_collisions.contains(stop_id.as_str()) {
                summary.save_errors += 1;
                error!(stop = %stop_id, "stop file name collides with another file, not saved");
                continue;
            }
            if let Err(e) = files.save_stop_data(stop_id, stop).await {
                summary.save_errors += 1;
                error!(stop = %stop_id, error = %e, "failed to save stop");
            }
        }
        if let Err(e) = files.save_all_stops(&stops).await {
            summary.save_errors += 1;
            error!(error = %e, "failed to save stop index");
        }

        let enriched_routes: BTreeMap<String, _> = metadata
            .iter()
            .map(|(route, variants)| {
                (
                    route.clone(),
                    create_enriched_route_data(route, variants, &route_stops, &details),
                )
            })
            .collect();
        let route_collisions =
            colliding_ids(enriched_routes.keys().map(String::as_str), ALL_ROUTES_FILE);
        for (route, data) in &enriched_routes {
            if route_collisions.contains(route.as_str()) {
                summary.save_errors += 1;
                error!(route = %route, "route file name collides with another file, not saved");
                continue;
            }
            if let Err(e) = files.save_route_data(route, data).await {
                summary.save_errors += 1;
                error!(route = %route, error = %e, "failed to save route");
            }
        }
        if let Err(e) = files
            .save_all_routes(&enriched_routes, &route_stops, &stops)
            .await
        {
            summary.save_errors += 1;
            error!(error = %e, "failed to save route index");
        }

        summary.elapsed = started.elapsed();
        if summary.stop_errors > 0 || summary.route_stop_errors > 0 || summary.save_errors > 0 {
            warn!(
                source = profile.name,
                stop_errors = summary.stop_errors,
                route_stop_errors = summary.route_stop_errors,
                save_errors = summary.save_errors,
                "finished with errors"
            );
        }
        info!(
            source = profile.name,
            routes = summary.routes,
            stops = summary.stops_total,
            fetched = summary.stops_fetched,
            reused = summary.stops_reused,
            elapsed = ?summary.elapsed,
            "finished collection"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{RouteInfo, RouteStop, StopDetail, StopRoutesMap},
        sources::{INBOUND, OUTBOUND, RouteStopFetch, SourceProfile, StopFetch},
    };
    use serde_json::Value;
    use tempfile::TempDir;

    const PROFILE: SourceProfile = SourceProfile {
        name: "fixed",
        company: "FIX",
        directions: &[INBOUND, OUTBOUND],
        multi_service: false,
    };

    /// One outbound route calling at `stops`, every lookup succeeding.
    struct FixedSource {
        stops: Vec<&'static str>,
    }

    impl BusSource for FixedSource {
        fn profile(&self) -> &SourceProfile {
            &PROFILE
        }

        async fn collect_routes(&self) -> Result<Vec<RouteInfo>> {
            Ok(vec![RouteInfo {
                route: "1".to_string(),
                ..Default::default()
            }])
        }

        async fn collect_route_stops(&self, _routes: &[RouteInfo]) -> Result<Vec<RouteStopFetch>> {
            let stops = self
                .stops
                .iter()
                .zip(1..)
                .map(|(stop, seq)| RouteStop {
                    route: "1".to_string(),
                    direction: "O".to_string(),
                    service_type: None,
                    seq,
                    stop: stop.to_string(),
                })
                .collect();
            Ok(vec![RouteStopFetch {
                route: "1".to_string(),
                stops,
                failures: vec![],
            }])
        }

        async fn collect_stop_details(
            &self,
            stop_ids: &[String],
            _stop_routes: &StopRoutesMap,
        ) -> Vec<StopFetch> {
            stop_ids
                .iter()
                .map(|id| {
                    StopFetch::fetched(
                        id.clone(),
                        StopDetail {
                            stop: id.clone(),
                            name_en: format!("{id} en"),
                            lat: "22.3".to_string(),
                            long: "114.1".to_string(),
                            ..Default::default()
                        },
                    )
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn clashing_file_names_count_as_save_errors() {
        let out = TempDir::new().unwrap();
        let config = Config {
            output_dir: out.path().to_path_buf(),
            ..Config::default()
        };
        let client = Arc::new(FetchClient::new(&config).unwrap());
        let service = Service::new(config, client);
        let source = FixedSource {
            stops: vec!["A/B", "A_B", "allstops"],
        };

        let summary = service.run(&source).await.unwrap();
        assert_eq!(summary.save_errors, 2);

        let stops_dir = out.path().join("fixed/stops");
        let saved: Value =
            serde_json::from_slice(&std::fs::read(stops_dir.join("A_B.json")).unwrap()).unwrap();
        assert_eq!(saved["stop"], "A/B");

        let all_stops: Value =
            serde_json::from_slice(&std::fs::read(stops_dir.join(ALL_STOPS_FILE)).unwrap())
                .unwrap();
        assert_eq!(all_stops.as_object().unwrap().len(), 3);
    }
}
