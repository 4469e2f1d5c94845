// scrape-hive command line runner
//
// Runs one crawl configured through SCRAPE_HIVE_* environment variables and
// prints every pushed update as a JSON line on stdout.

use anyhow::{bail, Result};
use scrape_hive_common::{
    CachedCapabilityChecker, CrawlUpdate, DisabledCapabilityChecker, FilterSet, LocationContext,
    ProxyProvider, RelayRegistry, ScraperSettings, SessionStore, StartRequest, UserAgentMode,
};
use scrape_hive_coordinator::{Collaborators, ControllerConfig, CrawlController, MapsExtractor};
use scrape_hive_worker::{providers, ChromeDriver, Metrics};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CAPABILITY_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }
}

fn print_update(update: &CrawlUpdate) -> Result<()> {
    println!("{}", serde_json::to_string(update)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = env_parse::<Level>("SCRAPE_HIVE_LOG_LEVEL").unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let request = load_request_from_env()?;
    let settings = load_settings_from_env();
    let data_dir = env::var("SCRAPE_HIVE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("scrape-hive-data"));

    let metrics = match env_parse::<u16>("SCRAPE_HIVE_METRICS_PORT") {
        Some(port) => {
            let metrics = Metrics::new()?;
            let server = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start_server(port).await {
                    error!("Metrics server stopped: {}", e);
                }
            });
            Some(metrics)
        }
        None => None,
    };

    let config = load_controller_config(&settings, &data_dir)?;
    let collaborators = Collaborators {
        driver: Arc::new(ChromeDriver::default()),
        sessions: SessionStore::open(data_dir.join("sessions")).await?,
        extractor: Arc::new(MapsExtractor::new()?),
        checker: Arc::new(CachedCapabilityChecker::new(
            DisabledCapabilityChecker,
            CAPABILITY_CACHE_TTL,
        )),
        metrics,
    };

    let (controller, mut updates) = CrawlController::new(config, collaborators);
    info!(search = %request.target.as_text(), "Starting crawl");

    let run = controller.start(request);
    tokio::pin!(run);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut stopping = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(update) = updates.recv() => print_update(&update)?,
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                controller.stop();
            }
        }
    };

    while let Ok(update) = updates.try_recv() {
        print_update(&update)?;
    }
    controller.shutdown().await;

    match outcome {
        Ok(records) => {
            info!(records = records.len(), "Crawl finished");
            Ok(())
        }
        Err(e) => {
            error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

fn load_request_from_env() -> Result<StartRequest> {
    let request = match (env::var("SCRAPE_HIVE_QUERY"), env::var("SCRAPE_HIVE_URL")) {
        (_, Ok(url)) => StartRequest::url(url),
        (Ok(query), _) => StartRequest::query(query),
        _ => bail!("Either SCRAPE_HIVE_QUERY or SCRAPE_HIVE_URL must be set"),
    };

    let location = LocationContext {
        city: env::var("SCRAPE_HIVE_CITY").ok(),
        country: env::var("SCRAPE_HIVE_COUNTRY").ok(),
    };

    let filters = FilterSet {
        min_rating: env_parse("SCRAPE_HIVE_MIN_RATING"),
        max_rating: env_parse("SCRAPE_HIVE_MAX_RATING"),
        max_reviews: env_parse("SCRAPE_HIVE_MAX_REVIEWS"),
        exclude_verified: env_parse("SCRAPE_HIVE_EXCLUDE_VERIFIED").unwrap_or(false),
        requires_messaging: env_parse("SCRAPE_HIVE_REQUIRES_MESSAGING").unwrap_or(false),
        detect_chatbot: env_parse("SCRAPE_HIVE_DETECT_CHATBOT").unwrap_or(false),
        strict_messaging_mode: env_parse("SCRAPE_HIVE_STRICT_MESSAGING"),
    };

    let request = request.with_location(location);
    Ok(if filters == FilterSet::default() {
        request
    } else {
        request.with_filters(filters)
    })
}

fn load_settings_from_env() -> ScraperSettings {
    let defaults = ScraperSettings::default();

    ScraperSettings {
        use_relays: env_parse("SCRAPE_HIVE_USE_RELAYS").unwrap_or(defaults.use_relays),
        headless: env_parse("SCRAPE_HIVE_HEADLESS").unwrap_or(defaults.headless),
        max_concurrent_tasks: env_parse("SCRAPE_HIVE_MAX_CONCURRENT_TASKS")
            .unwrap_or(defaults.max_concurrent_tasks),
        request_delay: env_parse::<u64>("SCRAPE_HIVE_REQUEST_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_delay),
        max_restarts: env_parse("SCRAPE_HIVE_MAX_RESTARTS").unwrap_or(defaults.max_restarts),
        user_agent_rotation: env_parse("SCRAPE_HIVE_USER_AGENT_ROTATION")
            .unwrap_or(defaults.user_agent_rotation),
    }
}

fn load_controller_config(settings: &ScraperSettings, data_dir: &Path) -> Result<ControllerConfig> {
    let mut config = ControllerConfig::from(settings);

    // Custom browser binary (e.g. /usr/bin/chromium); auto-detected otherwise
    config.browser.browser_path = env::var("SCRAPE_HIVE_BROWSER_PATH").ok().map(PathBuf::from);

    if let Some(mode) = env_parse::<UserAgentMode>("SCRAPE_HIVE_USER_AGENT_MODE") {
        config.browser.user_agent_mode = mode;
    }
    config.browser.user_agent = env::var("SCRAPE_HIVE_USER_AGENT").ok();

    let provider: Box<dyn ProxyProvider> = if settings.use_relays {
        Box::new(RelayRegistry::load(data_dir)?)
    } else {
        providers::create_from_env(data_dir)?
    };
    info!(provider = provider.name(), "Relay provider configured");
    config.browser.proxy_provider = Some(provider);

    Ok(config)
}
