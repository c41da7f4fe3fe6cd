use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use northstar_fe::{
    tracking_router, ClassImportance, ExecutionStatus, FeatureImportance, ImportanceReport,
    ImportanceSink, LogEntry, LogLevel, SqliteTrackingStore, StatusSink,
};
use serde_json::Value;
use tower::util::ServiceExt;

fn seeded_store() -> Arc<SqliteTrackingStore> {
    let store = SqliteTrackingStore::open_in_memory().unwrap();
    store
        .put_template("tpl", r#"{"predictedAsset": "gold"}"#)
        .unwrap();
    store.create_execution("exec-1", "tpl").unwrap();
    store
        .update_status(
            "exec-1",
            ExecutionStatus::Finished,
            &[LogEntry {
                at: 1_700_000_000_000,
                msg: "Training data generated. Data length=3".to_string(),
                level: LogLevel::Info,
            }],
        )
        .unwrap();
    Arc::new(store)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn execution_route_returns_status_and_logs() {
    let app = tracking_router(seeded_store());
    let (status, body) = get(app, "/executions/exec-1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "exec-1");
    assert_eq!(body["templateId"], "tpl");
    assert_eq!(body["processingStepStatus"], "FINISHED");
    assert_eq!(body["processingStepLogs"][0]["level"], "info");
    assert!(body["updatedAt"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let app = tracking_router(seeded_store());
    let (status, body) = get(app, "/executions/missing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn feature_importance_route_serves_stored_report() {
    let store = seeded_store();
    let app = tracking_router(store.clone());
    let (status, _) = get(app.clone(), "/executions/exec-1/feature-importance").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    store
        .put_importance(
            "exec-1",
            &ImportanceReport {
                feature_importance: vec![FeatureImportance {
                    feature: "EURUSD_RSI".to_string(),
                    importance: 1.0,
                }],
                by_asset_class: vec![ClassImportance {
                    asset_class: "FX".to_string(),
                    importance: 1.0,
                }],
            },
        )
        .unwrap();

    let (status, body) = get(app, "/executions/exec-1/feature-importance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["featureImportance"][0]["feature"], "EURUSD_RSI");
    assert_eq!(body["byAssetClass"][0]["assetClass"], "FX");
}
