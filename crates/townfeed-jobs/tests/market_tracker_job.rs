use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value as JsonValue};
use townfeed_jobs::{build_context, EtlConfig, JobKind, JobRunner};

const FEED: &str = "period_begin\tperiod_end\tstate_code\tcity\tproperty_type\tmedian_sale_price\thomes_sold\tmedian_dom\n\
2024-01-01\t2024-01-31\tNJ\tFort Lee\tAll Residential\t650000\t41\t38\n\
2024-01-01\t2024-01-31\tNJ\tFort Lee\tCondo/Co-op\t420000\t20\t45\n\
2024-01-01\t2024-01-31\tCT\tGreenwich\tAll Residential\t2100000\t30\t60\n\
2024-01-01\t2024-01-31\tNJ\tHoboken\tAll Residential\t800000\t50\t22\n\
2024-01-01\t2024-01-31\tNJ\tLakewood\tAll Residential\t500000\t70\t40\n\
2024-01-01\t2024-01-31\tNJ\tHoboken\tAll Residential\t810000\t51\t21\n";

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[derive(Clone, Default)]
struct StoreDouble {
    posts: Arc<Mutex<Vec<(String, String, Vec<JsonValue>)>>>,
}

async fn accept_upsert(
    State(store): State<StoreDouble>,
    Path(table): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(rows): Json<Vec<JsonValue>>,
) -> impl IntoResponse {
    let count = rows.len();
    let on_conflict = query.get("on_conflict").cloned().unwrap_or_default();
    store.posts.lock().unwrap().push((table, on_conflict, rows));
    (StatusCode::CREATED, [("content-range", format!("*/{count}"))])
}

fn feed_router(body: Vec<u8>) -> Router {
    Router::new().route(
        "/city_market_tracker.tsv000.gz",
        get(move || {
            let body = Bytes::from(body.clone());
            async move { body }
        }),
    )
}

async fn runner(vars: Vec<(&'static str, String)>) -> JobRunner {
    let vars: HashMap<String, String> = vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    let config = EtlConfig::from_lookup(move |name| vars.get(name).cloned()).unwrap();
    JobRunner::new(build_context(config).await.unwrap())
}

#[tokio::test]
async fn streams_filters_and_upserts_through_postgrest() {
    let feed = serve(feed_router(gzip(FEED))).await;
    let store = StoreDouble::default();
    let supabase = serve(
        Router::new()
            .route("/rest/v1/{table}", post(accept_upsert))
            .with_state(store.clone()),
    )
    .await;

    let runner = runner(vec![
        ("SUPABASE_URL", supabase),
        ("SUPABASE_SERVICE_KEY", "test-key".to_string()),
        ("TOWNFEED_MARKET_COLUMNS", "lowercase".to_string()),
        ("TOWNFEED_BATCH_SIZE", "2".to_string()),
        ("TOWNFEED_URL_MARKET_TRACKER", format!("{feed}/city_market_tracker.tsv000.gz")),
    ])
    .await;

    let response = runner.invoke(JobKind::MarketTracker, json!({})).await;
    assert_eq!(response.status_code, 200, "{:?}", response.body.error);
    let result = response.body.result.unwrap();
    assert_eq!(result["nj_lines_total"], 5);
    assert_eq!(result["towns_matched"], 2);
    assert_eq!(result["rows_upserted"], 3);
    assert_eq!(result["unmatched_nj_cities"], json!(["Lakewood"]));
    assert_eq!(result["upsert_result"], json!({"written": 3, "total_server_count": 3}));

    let posts = store.posts.lock().unwrap().clone();
    assert_eq!(posts.iter().map(|(_, _, rows)| rows.len()).collect::<Vec<_>>(), vec![2, 1]);
    assert!(posts
        .iter()
        .all(|(table, keys, _)| table == "market_data" && keys == "town_id,period_begin,property_type"));
    let hoboken = posts
        .iter()
        .flat_map(|(_, _, rows)| rows)
        .find(|row| row["town_id"] == "hoboken")
        .unwrap();
    assert_eq!(hoboken["median_sale_price"], 810000.0);
    assert_eq!(hoboken["homes_sold"], 51);
    assert!(hoboken["inventory"].is_null());
}

#[tokio::test]
async fn upstream_error_status_writes_nothing() {
    let feed = serve(Router::new().route(
        "/city_market_tracker.tsv000.gz",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    ))
    .await;
    let runner = runner(vec![
        ("TOWNFEED_STORE", "memory".to_string()),
        ("TOWNFEED_URL_MARKET_TRACKER", format!("{feed}/city_market_tracker.tsv000.gz")),
    ])
    .await;

    let response = runner.invoke(JobKind::MarketTracker, json!({})).await;
    assert_eq!(response.status_code, 500);
    let error = response.body.error.unwrap();
    assert!(error.contains("http status 500"), "{error}");
}

#[tokio::test]
async fn slow_upstream_times_out_without_writes() {
    let feed = serve(Router::new().route(
        "/city_market_tracker.tsv000.gz",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "late"
        }),
    ))
    .await;
    let store = StoreDouble::default();
    let supabase = serve(
        Router::new()
            .route("/rest/v1/{table}", post(accept_upsert))
            .with_state(store.clone()),
    )
    .await;
    let runner = runner(vec![
        ("SUPABASE_URL", supabase),
        ("SUPABASE_SERVICE_KEY", "test-key".to_string()),
        ("TOWNFEED_TIMEOUT_MARKET_TRACKER_SECS", "1".to_string()),
        ("TOWNFEED_URL_MARKET_TRACKER", format!("{feed}/city_market_tracker.tsv000.gz")),
    ])
    .await;

    let response = runner.invoke(JobKind::MarketTracker, json!({})).await;
    assert_eq!(response.status_code, 500);
    assert!(store.posts.lock().unwrap().is_empty());
}
