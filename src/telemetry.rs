//! Prometheus metrics and the health/metrics HTTP servers

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::types::pool_name;
use crate::error::{Error, Result};
use crate::sync::PoolEngineGate;

// =============================================================================
// Metrics
// =============================================================================

struct Metrics {
    engine_commands: IntCounterVec,
    reconciles: IntCounterVec,
    queue_depth: IntGaugeVec,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match register() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "Failed to register metrics");
                None
            }
        })
        .as_ref()
}

fn register() -> std::result::Result<Metrics, prometheus::Error> {
    Ok(Metrics {
        engine_commands: prometheus::register_int_counter_vec!(
            "cstor_pool_mgmt_engine_commands_total",
            "Pool and dataset tool invocations",
            &["tool", "verb", "outcome"]
        )?,
        reconciles: prometheus::register_int_counter_vec!(
            "cstor_pool_mgmt_reconciles_total",
            "Processed work items",
            &["kind", "operation", "outcome"]
        )?,
        queue_depth: prometheus::register_int_gauge_vec!(
            "cstor_pool_mgmt_queue_depth",
            "Work items waiting in the queue",
            &["kind"]
        )?,
    })
}

/// Count one external command
pub fn record_engine_command(tool: &str, verb: &str, success: bool) {
    if let Some(m) = metrics() {
        let outcome = if success { "success" } else { "failure" };
        m.engine_commands
            .with_label_values(&[tool, verb, outcome])
            .inc();
    }
}

/// Count one processed work item
pub fn record_reconcile(kind: &str, operation: &str, outcome: &str) {
    if let Some(m) = metrics() {
        m.reconciles
            .with_label_values(&[kind, operation, outcome])
            .inc();
    }
}

pub fn set_queue_depth(kind: &str, depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.with_label_values(&[kind]).set(depth as i64);
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
}

/// Readiness: not ready until the initial import; afterwards the body lists
/// the last observed health of every pool
fn readiness(gate: &PoolEngineGate) -> (StatusCode, String) {
    if !gate.is_imported() {
        return (StatusCode::SERVICE_UNAVAILABLE, "pools not imported".to_string());
    }
    let mut body = String::from("ok\n");
    for (uid, status) in gate.registry().statuses() {
        body.push_str(&format!(
            "{} {}{}\n",
            pool_name(&uid),
            status.health,
            if status.read_only { " read-only" } else { "" }
        ));
    }
    (StatusCode::OK, body)
}

/// Liveness is unconditional; readiness waits for the initial import latch
pub async fn run_health_server(
    addr: &str,
    gate: Arc<PoolEngineGate>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = parse_addr(addr, "health server")?;

    let make_svc = make_service_fn(move |_conn| {
        let gate = gate.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let gate = gate.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => {
                            let (status, body) = readiness(&gate);
                            respond(status, body)
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))
}

fn encode_metrics() -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => {
            let mut response = respond(StatusCode::OK, buffer);
            if let Ok(value) = encoder.format_type().parse() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    let addr = parse_addr(addr, "metrics server")?;
    // Register up front so the first scrape sees every family.
    let _ = metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => encode_metrics(),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))
}
