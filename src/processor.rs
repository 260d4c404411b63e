//! Pure reshaping of collected payloads. Nothing here does I/O.

use std::collections::BTreeMap;

use chrono::Utc;
use itertools::Itertools;

use crate::{
    model::{
        EnrichedRoute, EnrichedRouteStop, EnrichedStop, RouteInfo, RouteMetadata, RouteStop,
        RouteStopsMap, StopDetail, StopRoutesMap,
    },
    sources::{RouteStopFetch, SourceProfile, StopFetch},
};

/// Groups route variants by route number, keeping listing order within each.
pub fn build_route_metadata(routes: &[RouteInfo]) -> RouteMetadata {
    let mut metadata = RouteMetadata::new();
    for info in routes {
        metadata
            .entry(info.route.clone())
            .or_default()
            .push(info.clone());
    }
    metadata
}

/// Builds route → direction → service type → stops, and stop → routes.
///
/// Entries whose every request failed are skipped. Every direction of the
/// profile is present for each kept route, empty if its leg failed.
pub fn process_route_stop_results(
    results: &[RouteStopFetch],
    profile: &SourceProfile,
) -> (RouteStopsMap, StopRoutesMap) {
    let mut route_stops = RouteStopsMap::new();
    let mut stop_routes = StopRoutesMap::new();

    for result in results
        .iter()
        .filter(|r| !(r.stops.is_empty() && r.has_error()))
    {
        let directions = route_stops.entry(result.route.clone()).or_default();
        for direction in profile.directions {
            directions.entry(direction.code.to_string()).or_default();
        }

        for stop in &result.stops {
            directions
                .entry(stop.direction.clone())
                .or_default()
                .entry(stop.service_type().to_string())
                .or_default()
                .push(stop.clone());

            stop_routes
                .entry(stop.stop.clone())
                .or_default()
                .insert(&result.route);
        }
    }

    for stops in route_stops
        .values_mut()
        .flat_map(|d| d.values_mut())
        .flat_map(|s| s.values_mut())
    {
        stops.sort_by_key(|s| s.seq);
    }

    (route_stops, stop_routes)
}

/// Keeps only lookups that succeeded with a payload.
pub fn process_stop_details_results(results: Vec<StopFetch>) -> BTreeMap<String, StopDetail> {
    results
        .into_iter()
        .filter_map(|r| match r.result {
            Ok(Some(detail)) => Some((r.stop_id, detail)),
            _ => None,
        })
        .collect()
}

/// Attaches the freshly computed route set and a collection timestamp.
///
/// Only the detail fields of `detail` are kept, so routes recorded in an older
/// snapshot never leak into the result.
pub fn enrich_stop_with_routes(
    detail: StopDetail,
    stop_routes: &StopRoutesMap,
    stop_id: &str,
) -> EnrichedStop {
    let mut detail = detail;
    if detail.stop.is_empty() {
        detail.stop = stop_id.to_string();
    }

    EnrichedStop {
        detail,
        routes: stop_routes.get(stop_id).cloned().unwrap_or_default(),
        nearby_stop_ids: Vec::new(),
        data_timestamp: Utc::now(),
    }
}

/// Stand-in for a stop whose details could not be fetched.
pub fn fallback_stop(stop_id: &str) -> StopDetail {
    let name = format!("Stop {stop_id}");
    StopDetail {
        stop: stop_id.to_string(),
        name_en: name.clone(),
        name_tc: name.clone(),
        name_sc: name,
        lat: String::new(),
        long: String::new(),
    }
}

/// Links every stop to the other stops at exactly the same coordinates.
pub fn assign_nearby_stops(stops: &mut BTreeMap<String, EnrichedStop>) {
    let groups = stops
        .iter()
        .filter(|(_, s)| s.detail.has_coordinates())
        .map(|(id, s)| ((s.detail.lat.clone(), s.detail.long.clone()), id.clone()))
        .into_group_map();

    let mut nearby: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for ids in groups.into_values().filter(|ids| ids.len() > 1) {
        for id in &ids {
            let others = ids.iter().filter(|other| *other != id).cloned().sorted().collect();
            nearby.insert(id.clone(), others);
        }
    }

    for (id, stop) in stops.iter_mut() {
        stop.nearby_stop_ids = nearby.remove(id).unwrap_or_default();
    }
}

/// Order-independent route set equality. A missing side never matches.
pub fn compare_routes(previous: Option<&[String]>, current: Option<&[String]>) -> bool {
    match (previous, current) {
        (Some(a), Some(b)) => {
            a.len() == b.len() && a.iter().sorted().eq(b.iter().sorted())
        }
        _ => false,
    }
}

/// Sorts by direction, then service type, then sequence. Stable, so equal
/// keys keep their input order.
pub fn sort_route_stops(stops: &mut [RouteStop]) {
    stops.sort_by(|a, b| {
        a.direction
            .cmp(&b.direction)
            .then_with(|| a.service_type().cmp(b.service_type()))
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

/// Flattens a route's directions into one ordered list with stop names and
/// coordinates attached where the stop's details are known.
pub fn create_enriched_route_data(
    route: &str,
    variants: &[RouteInfo],
    route_stops: &RouteStopsMap,
    stops: &BTreeMap<String, StopDetail>,
) -> EnrichedRoute {
    let mut flat: Vec<RouteStop> = route_stops
        .get(route)
        .into_iter()
        .flat_map(|d| d.values())
        .flat_map(|s| s.values())
        .flatten()
        .cloned()
        .collect();
    sort_route_stops(&mut flat);

    let stops = flat
        .into_iter()
        .map(|route_stop| match stops.get(&route_stop.stop) {
            Some(detail) => EnrichedRouteStop {
                name_en: Some(detail.name_en.clone()),
                name_tc: Some(detail.name_tc.clone()),
                name_sc: Some(detail.name_sc.clone()),
                lat: Some(detail.lat.clone()),
                long: Some(detail.long.clone()),
                route_stop,
            },
            None => EnrichedRouteStop {
                route_stop,
                name_en: None,
                name_tc: None,
                name_sc: None,
                lat: None,
                long: None,
            },
        })
        .collect();

    EnrichedRoute {
        route: route.to_string(),
        variants: variants.to_vec(),
        stops,
        data_timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::NetworkError,
        sources::{INBOUND, OUTBOUND},
    };

    const PROFILE: SourceProfile = SourceProfile {
        name: "test",
        company: "TST",
        directions: &[INBOUND, OUTBOUND],
        multi_service: false,
    };

    fn rs(route: &str, dir: &str, seq: u32, stop: &str) -> RouteStop {
        RouteStop {
            route: route.to_string(),
            direction: dir.to_string(),
            service_type: None,
            seq,
            stop: stop.to_string(),
        }
    }

    fn detail(id: &str, lat: &str, long: &str) -> StopDetail {
        StopDetail {
            stop: id.to_string(),
            name_en: format!("{id} en"),
            name_tc: format!("{id} tc"),
            name_sc: format!("{id} sc"),
            lat: lat.to_string(),
            long: long.to_string(),
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn route_stop_results_build_both_maps() {
        let results = vec![
            RouteStopFetch {
                route: "1".to_string(),
                stops: vec![rs("1", "O", 2, "B"), rs("1", "O", 1, "A"), rs("1", "I", 1, "B")],
                failures: vec![],
            },
            RouteStopFetch {
                route: "2".to_string(),
                stops: vec![rs("2", "I", 1, "A")],
                failures: vec![NetworkError::new("u", "reset", None)],
            },
            RouteStopFetch {
                route: "3".to_string(),
                stops: vec![],
                failures: vec![
                    NetworkError::new("u", "reset", None),
                    NetworkError::new("u", "reset", None),
                ],
            },
        ];

        let (route_stops, stop_routes) = process_route_stop_results(&results, &PROFILE);

        assert_eq!(route_stops.keys().collect::<Vec<_>>(), ["1", "2"]);
        let outbound = &route_stops["1"]["O"]["1"];
        assert_eq!(outbound.iter().map(|s| s.seq).collect::<Vec<_>>(), [1, 2]);
        // the failed leg of route 2 still shows up, empty
        assert!(route_stops["2"]["O"].is_empty());

        assert_eq!(stop_routes["A"].as_slice(), ["1", "2"]);
        assert_eq!(stop_routes["B"].as_slice(), ["1"]);
    }

    #[test]
    fn stop_details_keep_only_payloads() {
        let results = vec![
            StopFetch::fetched("S1", detail("S1", "1", "2")),
            StopFetch::failed("S2", NetworkError::new("u", "boom", Some(500))),
            StopFetch {
                stop_id: "S3".to_string(),
                result: Ok(None),
                reused: false,
            },
        ];
        let details = process_stop_details_results(results);
        assert_eq!(details.keys().collect::<Vec<_>>(), ["S1"]);
    }

    #[test]
    fn enrichment_is_idempotent_apart_from_timestamp() {
        let mut stop_routes = StopRoutesMap::new();
        stop_routes.insert("S1".to_string(), ["1A", "2"].into_iter().collect());

        let first = enrich_stop_with_routes(detail("S1", "22.1", "114.1"), &stop_routes, "S1");
        let mut second = enrich_stop_with_routes(first.detail.clone(), &stop_routes, "S1");

        assert!(second.data_timestamp >= first.data_timestamp);
        second.data_timestamp = first.data_timestamp;
        assert_eq!(first, second);
        assert_eq!(first.routes.as_slice(), ["1A", "2"]);
    }

    #[test]
    fn enrichment_fills_missing_id() {
        let enriched = enrich_stop_with_routes(StopDetail::default(), &StopRoutesMap::new(), "S9");
        assert_eq!(enriched.detail.stop, "S9");
        assert!(enriched.routes.is_empty());
    }

    #[test]
    fn sorts_inbound_before_outbound_by_sequence() {
        let mut route_stops = RouteStopsMap::new();
        let dirs = route_stops.entry("1A".to_string()).or_default();
        dirs.entry("O".to_string())
            .or_default()
            .insert("1".to_string(), vec![rs("1A", "O", 3, "C")]);
        dirs.entry("I".to_string())
            .or_default()
            .insert("1".to_string(), vec![rs("1A", "I", 2, "B"), rs("1A", "I", 1, "A")]);

        let route = create_enriched_route_data("1A", &[], &route_stops, &BTreeMap::new());
        let order: Vec<_> = route
            .stops
            .iter()
            .map(|s| (s.route_stop.direction.as_str(), s.route_stop.seq))
            .collect();
        assert_eq!(order, [("I", 1), ("I", 2), ("O", 3)]);
    }

    #[test]
    fn sort_is_stable_on_duplicates() {
        let mut stops = vec![rs("1", "O", 3, "X"), rs("1", "I", 1, "A"), rs("1", "I", 1, "B"), rs("1", "I", 2, "C")];
        sort_route_stops(&mut stops);
        let ids: Vec<_> = stops.iter().map(|s| s.stop.as_str()).collect();
        assert_eq!(ids, ["A", "B", "C", "X"]);
    }

    #[test]
    fn route_stops_fall_back_to_bare_association() {
        let mut route_stops = RouteStopsMap::new();
        route_stops
            .entry("1A".to_string())
            .or_default()
            .entry("I".to_string())
            .or_default()
            .insert("1".to_string(), vec![rs("1A", "I", 1, "S1"), rs("1A", "I", 2, "S2")]);
        let mut details = BTreeMap::new();
        details.insert("S1".to_string(), detail("S1", "22.1", "114.1"));

        let route = create_enriched_route_data("1A", &[], &route_stops, &details);
        assert_eq!(route.stops[0].name_en.as_deref(), Some("S1 en"));
        assert_eq!(route.stops[0].lat.as_deref(), Some("22.1"));
        assert_eq!(route.stops[1].name_en, None);
        assert_eq!(route.stops[1].lat, None);
    }

    #[test]
    fn compare_routes_ignores_order() {
        assert!(compare_routes(Some(strings(&["2", "1"]).as_slice()), Some(strings(&["1", "2"]).as_slice())));
        assert!(!compare_routes(Some(strings(&["1"]).as_slice()), Some(strings(&["1", "2"]).as_slice())));
        assert!(!compare_routes(None, Some(strings(&["1"]).as_slice())));
        assert!(!compare_routes(None, None));
        assert!(!compare_routes(Some(strings(&["1", "1"]).as_slice()), Some(strings(&["1", "2"]).as_slice())));
    }

    #[test]
    fn nearby_stops_share_exact_coordinates() {
        let stop_routes = StopRoutesMap::new();
        let mut stops: BTreeMap<String, EnrichedStop> = [
            detail("A", "22.3", "114.1"),
            detail("B", "22.3", "114.1"),
            detail("C", "22.4", "114.1"),
        ]
        .into_iter()
        .map(|d| (d.stop.clone(), enrich_stop_with_routes(d, &stop_routes, "")))
        .collect();

        assign_nearby_stops(&mut stops);

        assert_eq!(stops["A"].nearby_stop_ids, ["B"]);
        assert_eq!(stops["B"].nearby_stop_ids, ["A"]);
        assert!(stops["C"].nearby_stop_ids.is_empty());
    }

    #[test]
    fn fallback_stops_are_never_nearby() {
        let stop_routes = StopRoutesMap::new();
        let mut stops: BTreeMap<String, EnrichedStop> = ["X", "Y"]
            .into_iter()
            .map(|id| (id.to_string(), enrich_stop_with_routes(fallback_stop(id), &stop_routes, id)))
            .collect();

        assign_nearby_stops(&mut stops);

        assert!(stops.values().all(|s| s.nearby_stop_ids.is_empty()));
        assert_eq!(stops["X"].detail.name_en, "Stop X");
    }

    #[test]
    fn route_metadata_groups_variants() {
        let routes = vec![
            RouteInfo {
                route: "1".to_string(),
                bound: Some("O".to_string()),
                ..Default::default()
            },
            RouteInfo {
                route: "2".to_string(),
                ..Default::default()
            },
            RouteInfo {
                route: "1".to_string(),
                bound: Some("I".to_string()),
                ..Default::default()
            },
        ];
        let metadata = build_route_metadata(&routes);
        assert_eq!(metadata["1"].len(), 2);
        assert_eq!(metadata["1"][1].bound.as_deref(), Some("I"));
        assert_eq!(metadata["2"].len(), 1);
    }
}
