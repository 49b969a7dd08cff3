//! Pantry Smoke Harness
//!
//! Drives the worker the way a browser would over one session: first deploy,
//! online browsing, an update applied from the page, offline browsing and a
//! couple of pushes. Everything runs against the in-memory network and the
//! tracing notifier. A JSON summary is printed to stdout; the exit code is
//! non-zero if any check failed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pantry_common::{init_logging, LogConfig, LogFormat};
use pantry_page::{PageHost, UpdateBridge, UpdateStatus};
use pantry_sw::request::ResponseSource;
use pantry_sw::{
    CacheStorage, ClickOutcome, ClientMessenger, DeploymentChecker, NetError, NotificationClick,
    PushOutcome, Registration, Request, Response, StaticNetwork, TracingNotifier, UpdateChecker,
    WorkerConfig, WorkerContext, WorkerState,
};
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

type SmokeResult<T> = Result<T, Box<dyn std::error::Error>>;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing collector for the scenario steps.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    async fn time<F: Future>(&self, operation: &'static str, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        self.record(operation, start.elapsed());
        output
    }

    fn summary(&self) -> serde_json::Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }
            let count = durations.len();
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            let max_ms = durations
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": (total_ms * 100.0).round() / 100.0,
                    "avg_ms": (total_ms / count as f64 * 100.0).round() / 100.0,
                    "max_ms": (max_ms * 100.0).round() / 100.0,
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Named pass/fail results, in order.
#[derive(Default)]
struct Checks {
    results: Vec<(&'static str, bool)>,
}

impl Checks {
    fn record(&mut self, name: &'static str, passed: bool) {
        if passed {
            info!(check = name, "Check passed");
        } else {
            warn!(check = name, "Check failed");
        }
        self.results.push((name, passed));
    }

    fn all_passed(&self) -> bool {
        self.results.iter().all(|(_, passed)| *passed)
    }

    fn summary(&self) -> serde_json::Value {
        let map = self
            .results
            .iter()
            .map(|(name, passed)| (name.to_string(), json!(passed)))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// The page: counts reloads.
#[derive(Default)]
struct SmokeHost {
    reloads: AtomicUsize,
}

impl PageHost for SmokeHost {
    fn reload(&self) {
        let n = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reloads = n, "Page reloaded");
    }

    fn navigate(&self, url: &Url) {
        info!(url = %url, "Page navigated");
    }
}

/// Parse command line arguments
struct Args {
    config: Option<String>,
    log_format: LogFormat,
    perf_output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut log_format = LogFormat::Compact;
        let mut perf_output = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = args.next();
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        log_format = LogFormat::parse(&val).unwrap_or(LogFormat::Compact);
                    }
                }
                "--perf-output" => {
                    perf_output = args.next();
                }
                _ => {}
            }
        }

        Self {
            config,
            log_format,
            perf_output,
        }
    }

    fn load_config(&self) -> SmokeResult<WorkerConfig> {
        match self.config {
            Some(ref path) => Ok(WorkerConfig::from_path(path)?),
            None => Ok(WorkerConfig {
                deployment: 3,
                ..WorkerConfig::default()
            }),
        }
    }
}

/// Canned origin content.
async fn seed(network: &StaticNetwork, config: &WorkerConfig) -> SmokeResult<()> {
    for path in &config.shell_manifest {
        network
            .serve(&config.resolve(path)?, Response::ok(format!("/* {path} */")))
            .await;
    }
    let pages = [
        ("/", "<html>home</html>"),
        ("/inventory", "<html>inventory</html>"),
        ("/static/img/shelf.webp", "RIFF shelf"),
        ("/api/inventory", r#"[{"item":"milk"}]"#),
        ("/api/auth/refresh", r#"{"token":"fresh"}"#),
    ];
    for (path, body) in pages {
        network.serve(&config.resolve(path)?, Response::ok(body)).await;
    }
    Ok(())
}

async fn run(config: &WorkerConfig, perf: &PerfTiming, checks: &mut Checks) -> SmokeResult<()> {
    let network = Arc::new(StaticNetwork::new());
    seed(&network, config).await?;
    let notifier = Arc::new(TracingNotifier::new());
    let (messenger, _windows) = ClientMessenger::new();
    let ctx = WorkerContext {
        caches: Arc::new(CacheStorage::new()),
        network: network.clone(),
        notifier: notifier.clone(),
        messenger: Arc::new(messenger),
    };
    let checker = Arc::new(DeploymentChecker::new(ctx.clone()));
    let registration = Registration::new(
        config.origin_url()?,
        Some(checker.clone() as Arc<dyn UpdateChecker>),
    );

    // First visit.
    let port = ctx.messenger.connect(config.resolve("/inventory")?).await;
    let host = Arc::new(SmokeHost::default());
    let (bridge, _messages) = UpdateBridge::mount(registration.clone(), port, host.clone()).await;

    checker.publish(config.clone()).await;
    perf.time("install", registration.update()).await?;
    let active = registration.active().await;
    checks.record(
        "first_deploy_active",
        active.is_some_and(|worker| worker.state() == WorkerState::Activated),
    );

    // Online browsing.
    let inventory = config.resolve("/inventory")?;
    let image = config.resolve("/static/img/shelf.webp")?;
    let api = config.resolve("/api/inventory")?;
    let online_image = perf
        .time("fetch", registration.fetch(Request::get(image.clone())))
        .await?;
    perf.time("fetch", registration.fetch(Request::navigate(inventory.clone())))
        .await?;
    perf.time("fetch", registration.fetch(Request::get(api.clone())))
        .await?;
    checks.record("api_never_cached", !ctx.caches.contains_anywhere(&api).await);

    // Update from the page.
    let next = config.next_deployment();
    checker.publish(next.clone()).await;
    let status = perf.time("update_check", bridge.check_for_updates()).await;
    checks.record("update_available", status == UpdateStatus::Available);

    let mut status_rx = bridge.subscribe();
    bridge.apply_update().await?;
    let reloaded = tokio::time::timeout(
        RELOAD_TIMEOUT,
        status_rx.wait_for(|s| *s == UpdateStatus::Current),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    checks.record(
        "reloaded_once",
        reloaded && host.reloads.load(Ordering::SeqCst) == 1,
    );
    checks.record(
        "only_current_bucket",
        ctx.caches.list_versions().await == vec![next.cache_version()],
    );

    // The reloaded page loads its document through the new worker.
    perf.time("fetch", registration.fetch(Request::navigate(inventory.clone())))
        .await?;

    // Offline browsing.
    network.set_offline(true);
    let document = registration
        .fetch(Request::navigate(config.resolve("/inventory?tab=expiring")?))
        .await?;
    checks.record(
        "offline_navigation_from_cache",
        document.is_some_and(|r| r.source == ResponseSource::Cache),
    );
    let shell_css = registration
        .fetch(Request::get(config.resolve("/static/css/main.css")?))
        .await?;
    checks.record(
        "offline_shell_asset",
        shell_css.is_some_and(|r| r.source == ResponseSource::Cache),
    );
    // The image was cached under the previous bucket, which is gone now.
    let offline_image = registration.fetch(Request::get(image)).await?;
    checks.record(
        "evicted_asset_not_served",
        online_image.is_some() && offline_image.is_some_and(|r| r.is_offline_fallback()),
    );
    let offline_api = registration.fetch(Request::get(api)).await?;
    checks.record(
        "offline_api_unavailable",
        offline_api.is_some_and(|r| r.is_offline_fallback()),
    );
    let refresh = registration
        .fetch(Request::post(
            config.resolve(&config.routes.auth_refresh_path)?,
            Bytes::from_static(b"{}"),
        ))
        .await;
    checks.record(
        "offline_auth_refresh_fails",
        matches!(refresh, Err(NetError::Offline)),
    );

    // Pushes.
    let defaults = &next.notifications;
    let outcome = perf
        .time("push", registration.push(Some(Bytes::from_static(b"{}"))))
        .await?;
    checks.record(
        "push_defaults",
        outcome == PushOutcome::Shown { title: defaults.title.clone() },
    );
    perf.time(
        "push",
        registration.push(Some(Bytes::from_static(b"Eggs expire today"))),
    )
    .await?;
    let shown = notifier.visible().await;
    checks.record(
        "push_raw_text_body",
        shown.last().is_some_and(|n| n.body == "Eggs expire today"),
    );

    if let Some(notification) = shown.last().cloned() {
        let click = NotificationClick {
            notification,
            action: Some(pantry_sw::push::ACTION_VIEW.to_string()),
        };
        let outcome = registration.notification_click(click).await?;
        checks.record(
            "click_focuses_page",
            matches!(outcome, ClickOutcome::Focused { ref url, .. } if url.path() == defaults.inventory_route),
        );
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(LogConfig::default().with_format(args.log_format));

    let start = Instant::now();
    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            let result = json!({
                "status": "fail",
                "reason": format!("config: {e}"),
            });
            println!("{}", result);
            std::process::exit(2);
        }
    };
    info!(version = %config.cache_version(), origin = %config.origin, "Starting smoke run");

    let perf = PerfTiming::new();
    let mut checks = Checks::default();
    let outcome = run(&config, &perf, &mut checks).await;

    if let Some(ref perf_path) = args.perf_output {
        let perf_json = json!({
            "timings": perf.summary(),
            "total_elapsed_ms": start.elapsed().as_millis()
        });
        if let Err(e) = std::fs::write(perf_path, perf_json.to_string()) {
            error!(?e, "Failed to write perf output");
        } else {
            info!(?perf_path, "Perf summary written");
        }
    }

    let passed = outcome.is_ok() && checks.all_passed();
    let status = if passed { "pass" } else { "fail" };
    let mut result = json!({
        "status": status,
        "elapsed_ms": start.elapsed().as_millis(),
        "from_version": config.cache_version().as_str(),
        "to_version": config.next_deployment().cache_version().as_str(),
        "checks": checks.summary(),
        "perf": perf.summary()
    });
    if let Err(e) = outcome {
        error!(error = %e, "Smoke run aborted");
        result["reason"] = json!(e.to_string());
    }
    println!("{}", result);

    if !passed {
        std::process::exit(1);
    }
}
