use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use scrape_hive_common::{BrowserStats, QueueStats};
use std::sync::Arc;

/// Prometheus view of one scraper instance
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub pending_tasks: IntGauge,
    pub in_flight_tasks: IntGauge,
    pub retried_tasks: IntGauge,
    pub failed_tasks: IntGauge,
    pub browser_restarts: IntGauge,
    pub open_pages: IntGauge,
    pub records_discovered: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let gauge = |name: &str, help: &str| -> anyhow::Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let pending_tasks = gauge(
            "scrape_hive_pending_tasks",
            "Tasks waiting for dispatch, including those in backoff",
        )?;
        let in_flight_tasks = gauge(
            "scrape_hive_in_flight_tasks",
            "Tasks currently being executed",
        )?;
        let retried_tasks = gauge(
            "scrape_hive_retried_tasks_total",
            "Task failures that were scheduled for another attempt",
        )?;
        let failed_tasks = gauge(
            "scrape_hive_failed_tasks_total",
            "Tasks dropped after exhausting their retries",
        )?;
        let browser_restarts = gauge(
            "scrape_hive_browser_restarts_total",
            "Browser relaunches after a crash",
        )?;
        let open_pages = gauge("scrape_hive_open_pages", "Pages currently checked out")?;

        let records_discovered = IntCounter::with_opts(Opts::new(
            "scrape_hive_records_discovered_total",
            "Listings surfaced by discovery",
        ))?;
        registry.register(Box::new(records_discovered.clone()))?;

        Ok(Self {
            registry,
            pending_tasks,
            in_flight_tasks,
            retried_tasks,
            failed_tasks,
            browser_restarts,
            open_pages,
            records_discovered,
        })
    }

    pub fn observe_queue(&self, stats: &QueueStats) {
        self.pending_tasks.set(stats.queue_length as i64);
        self.in_flight_tasks.set(stats.active_tasks as i64);
        self.retried_tasks.set(stats.total_retried as i64);
        self.failed_tasks.set(stats.total_failed as i64);
    }

    pub fn observe_browser(&self, stats: &BrowserStats) {
        self.browser_restarts.set(stats.total_restarts as i64);
        self.open_pages.set(stats.open_pages as i64);
    }

    /// Start HTTP server for Prometheus metrics on specified port
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }

    fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    match metrics.render() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_stats_are_rendered() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_queue(&QueueStats {
            queue_length: 4,
            active_tasks: 1,
            total_retried: 2,
            ..Default::default()
        });
        metrics.observe_browser(&BrowserStats {
            total_restarts: 3,
            open_pages: 2,
            ..Default::default()
        });
        metrics.records_discovered.inc();

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("scrape_hive_pending_tasks 4"));
        assert!(text.contains("scrape_hive_browser_restarts_total 3"));
        assert!(text.contains("scrape_hive_records_discovered_total 1"));
    }
}
