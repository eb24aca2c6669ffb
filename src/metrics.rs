use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGaugeVec, TextEncoder, opts, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec,
};
use tower_http::trace::TraceLayer;
use tracing::info;

const NAMESPACE: &str = "crsync";
const SUBSYSTEM: &str = "sync";

lazy_static! {
    pub static ref ERRORS_TOTAL: IntCounter = register_int_counter!(
        opts!("errors_total", "Number of failures across sync passes and jobs")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
    )
    .unwrap();
    pub static ref TAGS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        opts!("tags_total", "Number of tags present per registry and repository")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["registry", "repository"]
    )
    .unwrap();
    pub static ref TAGS_SYNCED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("tags_synced_total", "Number of synchronized tags per repository")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["source_registry", "destination_registry", "repository"]
    )
    .unwrap();
}

/// Serves the Prometheus text endpoint on `0.0.0.0:{port}`. Callers decide
/// whether to run it at all; port 0 means metrics are disabled.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving metrics at /metrics");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn render() -> (StatusCode, String) {
    let families = prometheus::gather();
    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_exposes_collectors() {
        TAGS_TOTAL
            .with_label_values(&["quay.io", "metrics-test/app"])
            .set(7);
        TAGS_SYNCED_TOTAL
            .with_label_values(&["quay.io", "docker.io", "metrics-test/app"])
            .inc();

        let (status, body) = render().await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("crsync_sync_tags_total"));
        assert!(body.contains("crsync_sync_tags_synced_total"));
        assert!(body.contains(r#"repository="metrics-test/app""#));
    }
}
