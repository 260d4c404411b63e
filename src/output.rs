use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::info;

use crate::{
    error::{Error, Result},
    model::{EnrichedRoute, EnrichedStop, RouteInfo, RouteStopsMap},
    sources::SourceProfile,
};

pub const ALL_STOPS_FILE: &str = "allstops.json";
pub const ALL_ROUTES_FILE: &str = "allroutes.json";

/// Writes one operator's `stops/` and `routes/` trees.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
    multi_service: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub original_bytes: usize,
    pub compact_bytes: usize,
}

impl CompactionStats {
    /// Compact size as a percentage of the original.
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 100.0;
        }
        self.compact_bytes as f64 * 100.0 / self.original_bytes as f64
    }
}

#[derive(Serialize)]
struct CompactRoutes<'a> {
    routes: BTreeMap<&'a str, CompactRoute<'a>>,
    stops: BTreeMap<&'a str, StopNames<'a>>,
}

#[derive(Serialize)]
struct CompactRoute<'a> {
    variants: &'a [RouteInfo],
    #[serde(flatten)]
    directions: BTreeMap<&'a str, CompactDirection<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum CompactDirection<'a> {
    Stops(Vec<&'a str>),
    ServiceTypes(BTreeMap<&'a str, Vec<&'a str>>),
}

#[derive(Serialize)]
struct StopNames<'a> {
    name_en: &'a str,
    name_tc: &'a str,
    name_sc: &'a str,
}

/// Full records, only used to measure how much compaction saves.
#[derive(Serialize)]
struct FullRoutes<'a> {
    routes: &'a BTreeMap<String, EnrichedRoute>,
    stops: &'a BTreeMap<String, EnrichedStop>,
}

impl FileManager {
    pub fn new(output_dir: &Path, profile: &SourceProfile) -> Self {
        Self {
            root: output_dir.join(profile.name),
            multi_service: profile.multi_service,
        }
    }

    pub fn stops_dir(&self) -> PathBuf {
        self.root.join("stops")
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.root.join("routes")
    }

    pub async fn ensure_directories(&self) -> Result<()> {
        for dir in [self.stops_dir(), self.routes_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::fs(&dir, e))?;
        }
        Ok(())
    }

    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::fs(path, e))
    }

    pub async fn save_stop_data(&self, stop_id: &str, stop: &EnrichedStop) -> Result<()> {
        let path = self.stops_dir().join(json_file_name(stop_id));
        self.write_json(path, stop).await
    }

    pub async fn save_route_data(&self, route: &str, data: &EnrichedRoute) -> Result<()> {
        let path = self.routes_dir().join(json_file_name(route));
        self.write_json(path, data).await
    }

    pub async fn save_all_stops(&self, stops: &BTreeMap<String, EnrichedStop>) -> Result<()> {
        self.write_json(self.stops_dir().join(ALL_STOPS_FILE), stops)
            .await
    }

    /// Writes `allroutes.json` with stop ids per direction instead of full
    /// records, plus one shared table of stop names.
    pub async fn save_all_routes(
        &self,
        routes: &BTreeMap<String, EnrichedRoute>,
        route_stops: &RouteStopsMap,
        stops: &BTreeMap<String, EnrichedStop>,
    ) -> Result<CompactionStats> {
        let compact = self.compact(routes, route_stops, stops);

        let stats = CompactionStats {
            original_bytes: serde_json::to_vec(&FullRoutes { routes, stops })?.len(),
            compact_bytes: serde_json::to_vec(&compact)?.len(),
        };
        info!(
            root = ?self.root,
            original_bytes = stats.original_bytes,
            compact_bytes = stats.compact_bytes,
            "compacted {} to {:.1}% of full size",
            ALL_ROUTES_FILE,
            stats.ratio()
        );

        self.write_json(self.routes_dir().join(ALL_ROUTES_FILE), &compact)
            .await?;
        Ok(stats)
    }

    fn compact<'a>(
        &self,
        routes: &'a BTreeMap<String, EnrichedRoute>,
        route_stops: &'a RouteStopsMap,
        stops: &'a BTreeMap<String, EnrichedStop>,
    ) -> CompactRoutes<'a> {
        let routes = routes
            .iter()
            .map(|(route, data)| {
                let directions = route_stops
                    .get(route)
                    .into_iter()
                    .flatten()
                    .map(|(direction, service_types)| {
                        let value = if self.multi_service {
                            CompactDirection::ServiceTypes(
                                service_types
                                    .iter()
                                    .map(|(st, list)| {
                                        (st.as_str(), list.iter().map(|s| s.stop.as_str()).collect())
                                    })
                                    .collect(),
                            )
                        } else {
                            CompactDirection::Stops(
                                service_types
                                    .values()
                                    .flatten()
                                    .map(|s| s.stop.as_str())
                                    .collect(),
                            )
                        };
                        (direction.as_str(), value)
                    })
                    .collect();

                (
                    route.as_str(),
                    CompactRoute {
                        variants: &data.variants,
                        directions,
                    },
                )
            })
            .collect();

        let stops = stops
            .iter()
            .map(|(id, stop)| {
                (
                    id.as_str(),
                    StopNames {
                        name_en: &stop.detail.name_en,
                        name_tc: &stop.detail.name_tc,
                        name_sc: &stop.detail.name_sc,
                    },
                )
            })
            .collect();

        CompactRoutes { routes, stops }
    }
}

/// Ids that would overwrite `reserved` or a file already claimed by an
/// earlier id once their names are sanitised.
pub fn colliding_ids<'a>(ids: impl IntoIterator<Item = &'a str>, reserved: &str) -> HashSet<&'a str> {
    let mut claimed = HashSet::from([reserved.to_string()]);
    ids.into_iter()
        .filter(|id| !claimed.insert(json_file_name(id)))
        .collect()
}

/// `<id>.json` with anything that could escape the directory replaced.
fn json_file_name(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.json")
}
