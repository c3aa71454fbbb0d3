use crate::cli::ServeArgs;
use crate::infra::{build_services, seed_demo_data, AppState, Stores};
use crate::routes::router;
use aquascore::config::AppConfig;
use aquascore::error::AppError;
use aquascore::telemetry;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let stores = Stores::default();
    if args.seed_demo {
        seed_demo_data(&stores);
    }
    let (scoring, risk, params, groups) = build_services(&stores, config.calibration.clone());
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        scoring,
        risk,
        params,
        groups,
    };

    let app = router().layer(Extension(app_state)).layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "revenue-recovery scoring service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
