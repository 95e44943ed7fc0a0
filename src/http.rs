//! HTTP routes: UPS metrics per target, exporter self metrics and a landing page.

use crate::collector::NutCollector;
use crate::config::{QueryOverlay, ScrapeOptions, WebPaths};
use crate::error::{Error, Result};
use crate::nut::Connector;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use log::{debug, error, info};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Serves the UPS metrics of one target.
///
/// Each target gets its own collector and registry so descriptors of different UPSes never
/// conflict, while repeated scrapes of the same target keep the same descriptors.
pub struct TargetHandler {
    collector: NutCollector,
    registry: Registry,
    requests: IntCounterVec,
    in_flight: IntGauge,
}

impl fmt::Debug for TargetHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetHandler")
            .field("collector", &self.collector)
            .field("in_flight", &self.in_flight.get())
            .finish_non_exhaustive()
    }
}

impl TargetHandler {
    /// Build the collector for `options` and a fresh registry for its request instrumentation.
    /// Talks to the NUT server when a preselected UPS has to be verified.
    pub async fn new(options: ScrapeOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let collector = NutCollector::new(options, connector).await?;

        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new(
                "promhttp_metric_handler_requests_total",
                "Total number of scrapes by HTTP status code.",
            ),
            &["code"],
        )?;
        let in_flight = IntGauge::new(
            "promhttp_metric_handler_requests_in_flight",
            "Current number of scrapes being served.",
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            collector,
            registry,
            requests,
            in_flight,
        })
    }

    /// Scrape the target and encode its metrics, along with the request instrumentation, in the
    /// text format. A scrape still running after `deadline` is abandoned and its NUT connection
    /// closed.
    pub async fn render(&self, deadline: Duration) -> Result<Vec<u8>> {
        let _in_flight = InFlight::enter(&self.in_flight);

        let encoded = match tokio::time::timeout(deadline, self.collector.scrape()).await {
            Ok(samples) => {
                let mut families = self.collector.families(samples);
                families.extend(self.registry.gather());
                families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
                encode(&families)
            }
            Err(_) => Err(Error::Deadline(deadline)),
        };

        let code = if encoded.is_ok() { "200" } else { "500" };
        self.requests.with_label_values(&[code]).inc();
        encoded
    }
}

/// Counts a request as in flight until dropped, also when the request is cancelled.
struct InFlight<'a>(&'a IntGauge);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn encode(families: &[MetricFamily]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(families, &mut buffer)?;
    Ok(buffer)
}

/// State shared by every request.
pub struct AppState {
    defaults: ScrapeOptions,
    connector: Arc<dyn Connector>,
    handlers: RwLock<HashMap<String, Arc<TargetHandler>>>,
    self_metrics: Option<PrometheusHandle>,
    paths: WebPaths,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("defaults", &self.defaults)
            .field("connector", &self.connector)
            .field("targets", &self.targets())
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create state that scrapes with `defaults` unless a request overrides them.
    #[must_use]
    pub fn new(defaults: ScrapeOptions, connector: Arc<dyn Connector>, paths: WebPaths) -> Self {
        Self {
            defaults,
            connector,
            handlers: RwLock::new(HashMap::new()),
            self_metrics: None,
            paths,
        }
    }

    /// Also render metrics recorded through the `metrics` facade on the exporter metrics path.
    #[must_use]
    pub fn with_self_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.self_metrics = Some(handle);
        self
    }

    /// Number of targets with a cached handler.
    #[must_use]
    pub fn targets(&self) -> usize {
        self.handlers.read().len()
    }

    fn cached(&self, key: &str) -> Option<Arc<TargetHandler>> {
        self.handlers.read().get(key).map(Arc::clone)
    }

    /// Store a freshly built handler unless a concurrent request stored one first, returning the
    /// handler to use.
    fn insert(&self, key: String, handler: TargetHandler) -> Arc<TargetHandler> {
        let mut handlers = self.handlers.write();
        let handler = Arc::clone(handlers.entry(key).or_insert_with(|| Arc::new(handler)));
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(format!("{}_exporter_handler_cache_entries", self.defaults.namespace)).set(handlers.len() as f64);
        handler
    }
}

/// Periodically drain the histograms held by the `metrics` recorder behind `handle`, which would
/// otherwise only happen when the exporter metrics path is scraped.
pub fn spawn_upkeep(handle: PrometheusHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            handle.run_upkeep();
        }
    })
}

/// Build the router serving UPS metrics, exporter metrics and the landing page.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.paths.ups, get(ups_metrics))
        .route(&state.paths.exporter, get(exporter_metrics))
        .route("/", get(landing_page))
        .with_state(state)
}

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

fn text_response(body: Vec<u8>) -> Response {
    let mut res = Response::new(body.into());
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    res
}

fn internal_error(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("500 - {message}\n")).into_response()
}

async fn ups_metrics(State(state): State<Arc<AppState>>, Query(query): Query<QueryOverlay>) -> Response {
    let options = state.defaults.overlay(&query);
    let key = options.cache_key();
    let deadline = options.timeout;
    let started = Instant::now();

    let handler = if let Some(handler) = state.cached(&key) {
        debug!("Using existing handler for UPS {key}");
        handler
    } else {
        info!("Creating new registry, handler and collector for UPS {key}");
        let connector = Arc::clone(&state.connector);
        match tokio::time::timeout(deadline, TargetHandler::new(options, connector)).await {
            Ok(Ok(handler)) => state.insert(key.clone(), handler),
            Ok(Err(err)) => {
                error!("Could not create collector for UPS {key}: {err}");
                return internal_error(&err.to_string());
            }
            Err(_) => {
                let err = Error::Deadline(deadline);
                error!("Could not create collector for UPS {key}: {err}");
                return internal_error(&err.to_string());
            }
        }
    };

    let response = match handler.render(deadline).await {
        Ok(body) => text_response(body),
        Err(err) => {
            error!("Could not serve metrics for UPS {key}: {err}");
            internal_error(&err.to_string())
        }
    };

    let namespace = &state.defaults.namespace;
    metrics::counter!(format!("{namespace}_exporter_scrapes_total"), "target" => key).increment(1);
    metrics::histogram!(format!("{namespace}_exporter_scrape_duration_seconds")).record(started.elapsed().as_secs_f64());
    response
}

async fn exporter_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut body = match encode(&prometheus::gather()) {
        Ok(body) => body,
        Err(err) => {
            error!("Could not encode exporter metrics: {err}");
            return internal_error(&err.to_string());
        }
    };
    if let Some(handle) = &state.self_metrics {
        body.extend_from_slice(handle.render().as_bytes());
    }
    text_response(body)
}

async fn landing_page(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        "<html>
<head><title>NUT Exporter</title></head>
<body>
<h1>NUT Exporter</h1>
<p><a href='{}'>UPS metrics</a></p>
<p><a href='{}'>Exporter metrics</a></p>
</body>
</html>
",
        state.paths.ups, state.paths.exporter
    ))
}
