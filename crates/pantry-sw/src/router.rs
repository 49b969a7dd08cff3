//! Request routing.
//!
//! Every intercepted request is classified by [`classify`] into one row of
//! the routing table, then [`RequestRouter::handle`] runs the read/write
//! strategy of that row against the cache bucket of the current deployment
//! and the network.
//!
//! | row | matches | decision |
//! |-----|---------|----------|
//! | `PassThrough` | non-GET, not the auth refresh | `NeverCache` |
//! | `AuthRefresh` | `POST <auth_refresh_path>` | `NetworkOnly`, errors propagate |
//! | `AuthEndpoint` | `<auth_prefix>*` | `NetworkOnly` |
//! | `Api` | `<api_prefix>*` | `NetworkOnly` |
//! | `Navigation` | document loads | `NetworkFirstWithFallback` |
//! | `StaticAsset` | `/static/*`, `.css`, `.js`, images | `CacheFirstWithRefresh` |
//! | `Other` | anything else | `CacheFirstWithRefresh`, read-only |

use std::sync::Arc;

use http::Method;
use tracing::{debug, trace, warn};

use crate::cache::{CacheStorage, CacheVersion};
use crate::config::RouteConfig;
use crate::request::{Request, Response};
use crate::network::{NetError, Network};

/// Read/write policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Not intercepted at all.
    NeverCache,
    NetworkOnly,
    NetworkFirstWithFallback,
    CacheFirstWithRefresh,
}

/// The routing table row a request matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRule {
    PassThrough,
    AuthRefresh,
    AuthEndpoint,
    Api,
    Navigation,
    StaticAsset,
    Other,
}

impl RouteRule {
    pub fn decision(self) -> RoutingDecision {
        match self {
            RouteRule::PassThrough => RoutingDecision::NeverCache,
            RouteRule::AuthRefresh | RouteRule::AuthEndpoint | RouteRule::Api => {
                RoutingDecision::NetworkOnly
            }
            RouteRule::Navigation => RoutingDecision::NetworkFirstWithFallback,
            RouteRule::StaticAsset | RouteRule::Other => RoutingDecision::CacheFirstWithRefresh,
        }
    }

    /// Whether a network response on this row may be written to the cache.
    pub fn writes_cache(self) -> bool {
        matches!(self, RouteRule::Navigation | RouteRule::StaticAsset)
    }
}

/// Classify a request. Pure: depends only on method, URL and mode.
pub fn classify(routes: &RouteConfig, request: &Request) -> RouteRule {
    let path = request.url.path();

    if request.method != Method::GET {
        if request.method == Method::POST && path == routes.auth_refresh_path {
            return RouteRule::AuthRefresh;
        }
        return RouteRule::PassThrough;
    }
    if path.starts_with(&routes.auth_prefix) {
        return RouteRule::AuthEndpoint;
    }
    if path.starts_with(&routes.api_prefix) {
        return RouteRule::Api;
    }
    if request.is_navigation() {
        return RouteRule::Navigation;
    }
    if is_static_asset(routes, path) {
        return RouteRule::StaticAsset;
    }
    RouteRule::Other
}

fn is_static_asset(routes: &RouteConfig, path: &str) -> bool {
    if routes.static_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return true;
    }
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((_, ext)) => routes
            .static_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

/// Executes routing decisions against one cache bucket.
pub struct RequestRouter {
    routes: RouteConfig,
    version: CacheVersion,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
}

impl RequestRouter {
    pub fn new(
        routes: RouteConfig,
        version: CacheVersion,
        caches: Arc<CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            routes,
            version,
            caches,
            network,
        }
    }

    /// The bucket this router reads from and writes to.
    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn classify(&self, request: &Request) -> RouteRule {
        classify(&self.routes, request)
    }

    /// Handle an intercepted request.
    ///
    /// `Ok(None)` means the request is not intercepted and the host should
    /// fetch it itself. The only error ever returned is the network failure
    /// of the auth refresh; every other failure degrades to a cached copy or
    /// to [`Response::offline`].
    pub async fn handle(&self, request: &Request) -> Result<Option<Response>, NetError> {
        let rule = self.classify(request);
        trace!(url = %request.url, method = %request.method, ?rule, "Routing request");

        let response = match rule {
            RouteRule::PassThrough => return Ok(None),
            RouteRule::AuthRefresh => self.network.fetch(request).await?,
            RouteRule::AuthEndpoint | RouteRule::Api => self.network_only(request).await,
            RouteRule::Navigation => self.network_first(request).await,
            RouteRule::StaticAsset | RouteRule::Other => self.cache_first(request, rule).await,
        };
        Ok(Some(response))
    }

    async fn network_only(&self, request: &Request) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network-only request failed");
                Response::offline()
            }
        }
    }

    async fn network_first(&self, request: &Request) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => {
                self.store(request, &response, RouteRule::Navigation).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation offline, trying cache");
                match self.caches.match_ignoring_search(&self.version, request).await {
                    Some(cached) => cached,
                    None => {
                        warn!(url = %request.url, "No cached document, serving offline response");
                        Response::offline()
                    }
                }
            }
        }
    }

    async fn cache_first(&self, request: &Request, rule: RouteRule) -> Response {
        if let Some(cached) = self.caches.match_request(&self.version, request).await {
            trace!(url = %request.url, "Cache hit");
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.store(request, &response, rule).await;
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed with nothing cached");
                Response::offline()
            }
        }
    }

    async fn store(&self, request: &Request, response: &Response, rule: RouteRule) {
        if !rule.writes_cache() || !response.is_cacheable() {
            return;
        }
        if let Err(e) = self.caches.put(&self.version, request, response).await {
            warn!(url = %request.url, error = %e, "Failed to cache response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestDestination, ResponseSource, ResponseType};
    use crate::network::StaticNetwork;
    use bytes::Bytes;
    use http::StatusCode;
    use url::Url;

    fn url(path: &str) -> Url {
        Url::parse("https://pantry.test").unwrap().join(path).unwrap()
    }

    fn routes() -> RouteConfig {
        RouteConfig::default()
    }

    async fn router() -> (RequestRouter, Arc<StaticNetwork>, Arc<CacheStorage>) {
        let version = CacheVersion::for_deployment("pantry", 1);
        let caches = Arc::new(CacheStorage::new());
        caches.open(&version).await;
        let network = Arc::new(StaticNetwork::new());
        let router = RequestRouter::new(routes(), version, caches.clone(), network.clone());
        (router, network, caches)
    }

    #[test]
    fn test_classification_table() {
        let r = routes();
        let cases = [
            (Request::post(url("/api/items"), Bytes::new()), RouteRule::PassThrough),
            (Request::post(url("/api/auth/refresh"), Bytes::new()), RouteRule::AuthRefresh),
            (Request::get(url("/api/auth/me")), RouteRule::AuthEndpoint),
            (Request::get(url("/api/inventory")), RouteRule::Api),
            (Request::navigate(url("/inventory")), RouteRule::Navigation),
            (Request::get(url("/static/media/photo")), RouteRule::StaticAsset),
            (Request::get(url("/bundle.JS")), RouteRule::StaticAsset),
            (Request::get(url("/favicon.ico")), RouteRule::StaticAsset),
            (Request::get(url("/robots.txt")), RouteRule::Other),
        ];
        for (request, expected) in cases {
            assert_eq!(classify(&r, &request), expected, "{}", request.url);
        }
    }

    #[test]
    fn test_api_wins_over_navigation() {
        let request = Request::get(url("/api/auth/callback")).destination(RequestDestination::Document);
        assert_eq!(classify(&routes(), &request), RouteRule::AuthEndpoint);
    }

    #[test]
    fn test_put_to_auth_refresh_is_passthrough() {
        let mut request = Request::post(url("/api/auth/refresh"), Bytes::new());
        request.method = Method::PUT;
        assert_eq!(classify(&routes(), &request), RouteRule::PassThrough);
    }

    #[test]
    fn test_decisions() {
        assert_eq!(RouteRule::PassThrough.decision(), RoutingDecision::NeverCache);
        assert_eq!(RouteRule::Api.decision(), RoutingDecision::NetworkOnly);
        assert_eq!(
            RouteRule::Navigation.decision(),
            RoutingDecision::NetworkFirstWithFallback
        );
        assert_eq!(RouteRule::Other.decision(), RoutingDecision::CacheFirstWithRefresh);
    }

    #[tokio::test]
    async fn test_passthrough_is_not_intercepted() {
        let (router, network, _) = router().await;
        let result = router
            .handle(&Request::post(url("/api/items"), Bytes::new()))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(network.hits(), 0);
    }

    #[tokio::test]
    async fn test_auth_refresh_error_propagates() {
        let (router, network, _) = router().await;
        network.set_offline(true);
        let result = router
            .handle(&Request::post(url("/api/auth/refresh"), Bytes::new()))
            .await;
        assert!(matches!(result, Err(NetError::Offline)));
        assert_eq!(network.hits(), 1);
    }

    #[tokio::test]
    async fn test_api_is_never_cached() {
        let (router, network, caches) = router().await;
        network.serve(&url("/api/inventory"), Response::ok("[]")).await;

        let response = router.handle(&Request::get(url("/api/inventory"))).await.unwrap().unwrap();
        assert_eq!(&response.body[..], b"[]");
        assert!(!caches.contains_anywhere(&url("/api/inventory")).await);

        network.set_offline(true);
        let offline = router.handle(&Request::get(url("/api/inventory"))).await.unwrap().unwrap();
        assert!(offline.is_offline_fallback());
    }

    #[tokio::test]
    async fn test_static_asset_cached_after_first_fetch() {
        let (router, network, _) = router().await;
        network.serve(&url("/static/js/main.js"), Response::ok("console.log(1)")).await;

        let first = router.handle(&Request::get(url("/static/js/main.js"))).await.unwrap().unwrap();
        assert_eq!(first.source, ResponseSource::Network);

        network.set_offline(true);
        let second = router.handle(&Request::get(url("/static/js/main.js"))).await.unwrap().unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.body, first.body);
        assert_eq!(network.hits(), 1);
    }

    #[tokio::test]
    async fn test_opaque_and_error_responses_not_cached() {
        let (router, network, caches) = router().await;
        network
            .serve(&url("/static/img/a.png"), Response::ok("img").with_type(ResponseType::Opaque))
            .await;

        router.handle(&Request::get(url("/static/img/a.png"))).await.unwrap();
        router.handle(&Request::get(url("/static/img/missing.png"))).await.unwrap();

        assert!(!caches.contains_anywhere(&url("/static/img/a.png")).await);
        assert!(!caches.contains_anywhere(&url("/static/img/missing.png")).await);
    }

    #[tokio::test]
    async fn test_uncategorized_not_written() {
        let (router, network, caches) = router().await;
        network.serve(&url("/robots.txt"), Response::ok("User-agent: *")).await;
        router.handle(&Request::get(url("/robots.txt"))).await.unwrap();
        assert!(!caches.contains_anywhere(&url("/robots.txt")).await);

        network.set_offline(true);
        let response = router.handle(&Request::get(url("/robots.txt"))).await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_navigation_falls_back_to_cache() {
        let (router, network, _) = router().await;
        network.serve(&url("/inventory?tab=all"), Response::ok("<html>inv</html>")).await;

        let online = router
            .handle(&Request::navigate(url("/inventory?tab=all")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(online.source, ResponseSource::Network);

        network.set_offline(true);
        let offline = router
            .handle(&Request::navigate(url("/inventory?tab=expiring")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offline.source, ResponseSource::Cache);
        assert_eq!(&offline.body[..], b"<html>inv</html>");
    }

    #[tokio::test]
    async fn test_navigation_prefers_network_when_online() {
        let (router, network, _) = router().await;
        network.serve(&url("/login"), Response::ok("v1")).await;
        router.handle(&Request::navigate(url("/login"))).await.unwrap();

        network.serve(&url("/login"), Response::ok("v2")).await;
        let response = router.handle(&Request::navigate(url("/login"))).await.unwrap().unwrap();
        assert_eq!(&response.body[..], b"v2");
    }

    #[tokio::test]
    async fn test_navigation_without_cache_is_offline_response() {
        let (router, network, _) = router().await;
        network.set_offline(true);
        let response = router.handle(&Request::navigate(url("/recipes"))).await.unwrap().unwrap();
        assert!(response.is_offline_fallback());
    }
}
