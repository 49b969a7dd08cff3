//! The update banner flow: check, apply, reload once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pantry_page::{PageHost, UpdateBridge, UpdateStatus};
use pantry_sw::{
    CacheStorage, CacheVersion, ClientMessenger, DeploymentChecker, Registration,
    StaticNetwork, TracingNotifier, UpdateChecker, WorkerConfig, WorkerContext, WorkerState,
};
use url::Url;

#[derive(Default)]
struct CountingHost {
    reloads: AtomicUsize,
}

impl PageHost for CountingHost {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

struct Page {
    ctx: WorkerContext,
    checker: Arc<DeploymentChecker>,
    registration: Arc<Registration>,
    host: Arc<CountingHost>,
    bridge: Arc<UpdateBridge>,
}

fn deployment(n: u32) -> WorkerConfig {
    WorkerConfig {
        deployment: n,
        ..WorkerConfig::default()
    }
}

async fn open_page() -> Page {
    let (messenger, _) = ClientMessenger::new();
    let ctx = WorkerContext {
        caches: Arc::new(CacheStorage::new()),
        network: Arc::new(StaticNetwork::new()),
        notifier: Arc::new(TracingNotifier::new()),
        messenger: Arc::new(messenger),
    };
    let scope = Url::parse("http://localhost:3000/").unwrap();
    let checker = Arc::new(DeploymentChecker::new(ctx.clone()));
    let registration = Registration::new(scope.clone(), Some(checker.clone() as Arc<dyn UpdateChecker>));

    let port = ctx.messenger.connect(scope).await;
    let host = Arc::new(CountingHost::default());
    let (bridge, _messages) = UpdateBridge::mount(registration.clone(), port, host.clone()).await;

    checker.publish(deployment(3)).await;
    registration.update().await.unwrap();

    Page {
        ctx,
        checker,
        registration,
        host,
        bridge,
    }
}

#[tokio::test]
async fn check_without_new_deployment_is_current() {
    let page = open_page().await;
    assert_eq!(page.bridge.check_for_updates().await, UpdateStatus::Current);
    assert_eq!(page.bridge.status(), UpdateStatus::Current);
}

#[tokio::test]
async fn check_finds_new_deployment() {
    let page = open_page().await;
    page.checker.publish(deployment(4)).await;

    assert_eq!(page.bridge.check_for_updates().await, UpdateStatus::Available);
    let waiting = page.registration.waiting().await.unwrap();
    assert_eq!(waiting.version(), &CacheVersion::new("pantry-v4"));
    assert_eq!(waiting.state(), WorkerState::Installed);
}

#[tokio::test]
async fn apply_update_reloads_once_per_update() {
    let page = open_page().await;
    page.checker.publish(deployment(4)).await;
    page.bridge.check_for_updates().await;

    let mut status = page.bridge.subscribe();
    page.bridge.apply_update().await.unwrap();
    assert_eq!(page.bridge.status(), UpdateStatus::Updating);

    status.wait_for(|s| *s == UpdateStatus::Current).await.unwrap();
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        page.ctx.caches.list_versions().await,
        vec![CacheVersion::new("pantry-v4")]
    );

    // The page stays mounted after reloading; the next update reloads again.
    page.checker.publish(deployment(5)).await;
    assert_eq!(page.bridge.check_for_updates().await, UpdateStatus::Available);
    page.bridge.apply_update().await.unwrap();
    status.wait_for(|s| *s == UpdateStatus::Current).await.unwrap();
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 2);
    assert_eq!(
        page.registration.active().await.unwrap().version(),
        &CacheVersion::new("pantry-v5")
    );
}
