#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::Path as UrlPath,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use hk_bus_data::config::Config;
use serde_json::{Value, json};

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

pub fn config(base: &str, output: &Path) -> Config {
    Config {
        output_dir: output.to_path_buf(),
        requests_per_second: 1000.0,
        concurrency: 4,
        request_timeout: Duration::from_secs(5),
        large_request_timeout: Duration::from_secs(5),
        retry_limit: 0,
        retry_backoff: Duration::from_millis(10),
        cache_enabled: false,
        cache_dir: output.join("cache"),
        ctb_base_url: format!("{base}/ctb"),
        kmb_base_url: format!("{base}/kmb"),
        ..Config::default()
    }
}

pub fn read_json(path: impl AsRef<Path>) -> Value {
    let bytes = std::fs::read(path.as_ref())
        .unwrap_or_else(|e| panic!("reading {:?}: {e}", path.as_ref()));
    serde_json::from_slice(&bytes).unwrap()
}

#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn ctb_stop(id: &str) -> Value {
    json!({
        "data": {
            "stop": id,
            "name_en": format!("{id} Street"),
            "name_tc": format!("{id} 街"),
            "name_sc": format!("{id} 街"),
            "lat": "22.28",
            "long": format!("114.1{}", id.len()),
            "data_timestamp": "2024-01-01T00:00:00+08:00"
        }
    })
}

/// Citybus route 1A: S1 inbound, S2 outbound. Stop ids and direction legs
/// listed in `failing` answer 500. `stop_hits` counts stop detail requests.
pub fn ctb_router(failing: &'static [&'static str], stop_hits: Hits) -> Router {
    Router::new()
        .route(
            "/ctb/route/CTB",
            get(|| async {
                Json(json!({
                    "data": [{
                        "co": "CTB", "route": "1A",
                        "orig_en": "Central", "dest_en": "Stanley",
                        "data_timestamp": "2024-01-01T00:00:00+08:00"
                    }]
                }))
            }),
        )
        .route(
            "/ctb/route-stop/CTB/{route}/{leg}",
            get(move |UrlPath((route, leg)): UrlPath<(String, String)>| async move {
                if failing.contains(&leg.as_str()) {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                }
                let (dir, stop) = if leg == "inbound" { ("I", "S1") } else { ("O", "S2") };
                Json(json!({
                    "data": [{ "co": "CTB", "route": route, "dir": dir, "seq": 1, "stop": stop }]
                }))
                .into_response()
            }),
        )
        .route(
            "/ctb/stop/{id}",
            get(move |UrlPath(id): UrlPath<String>| {
                let stop_hits = stop_hits.clone();
                async move {
                    stop_hits.bump();
                    if failing.contains(&id.as_str()) {
                        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                    }
                    Json(ctb_stop(&id)).into_response()
                }
            }),
        )
}

pub fn status(code: StatusCode) -> Response {
    (code, "").into_response()
}
