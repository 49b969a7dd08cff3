//! The network seam.
//!
//! The worker never talks to a socket directly; it goes through [`Network`].
//! [`HttpNetwork`] is the real implementation on top of `reqwest`;
//! [`StaticNetwork`] serves canned responses and can be switched offline,
//! which is what the smoke harness and the scenario tests drive.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::request::{Request, Response, ResponseSource, ResponseType};

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network unreachable")]
    Offline,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Anything that can turn a request into a response.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// `reqwest`-backed network.
pub struct HttpNetwork {
    client: Client,
    /// Origin of the pages this worker serves; cross-origin `no-cors`
    /// responses are marked opaque.
    origin: Option<Url>,
}

impl HttpNetwork {
    /// Create a network with a default client.
    pub fn new() -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(concat!("pantry-sw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            origin: None,
        }
    }

    /// Set the page origin used for opacity decisions.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    fn response_type(&self, request: &Request) -> ResponseType {
        use crate::request::RequestMode;

        match (&self.origin, request.mode) {
            (Some(origin), RequestMode::NoCors) if origin.origin() != request.url.origin() => {
                ResponseType::Opaque
            }
            (Some(origin), RequestMode::Cors) if origin.origin() != request.url.origin() => {
                ResponseType::Cors
            }
            _ => ResponseType::Basic,
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
            response_type: self.response_type(request),
            source: ResponseSource::Network,
        })
    }
}

/// In-memory network with canned responses and an offline switch.
#[derive(Default)]
pub struct StaticNetwork {
    routes: RwLock<HashMap<String, Response>>,
    offline: AtomicBool,
    hits: AtomicUsize,
    log: RwLock<Vec<(Method, Url)>>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `url` (fragment ignored).
    pub async fn serve(&self, url: &Url, response: Response) {
        self.routes.write().await.insert(route_key(url), response);
    }

    /// Stop serving `url`; it will answer 404 while online.
    pub async fn unserve(&self, url: &Url) {
        self.routes.write().await.remove(&route_key(url));
    }

    /// Switch the network off (every fetch fails) or back on.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of fetches attempted, online or not.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Every (method, url) that reached this network.
    pub async fn requests(&self) -> Vec<(Method, Url)> {
        self.log.read().await.clone()
    }
}

#[async_trait]
impl Network for StaticNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.log
            .write()
            .await
            .push((request.method.clone(), request.url.clone()));

        if self.is_offline() {
            trace!(url = %request.url, "Static network offline");
            return Err(NetError::Offline);
        }

        let response = match self.routes.read().await.get(&route_key(&request.url)) {
            Some(response) => response.clone(),
            None => Response::new(StatusCode::NOT_FOUND, "Not Found"),
        };
        Ok(Response {
            url: Some(request.url.clone()),
            source: ResponseSource::Network,
            ..response
        })
    }
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestMode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(path: &str) -> Url {
        Url::parse("https://pantry.test").unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn test_static_network_serves_and_goes_offline() {
        let network = StaticNetwork::new();
        network.serve(&url("/static/js/main.js"), Response::ok("js")).await;

        let response = network.fetch(&Request::get(url("/static/js/main.js#x"))).await.unwrap();
        assert_eq!(&response.body[..], b"js");

        let missing = network.fetch(&Request::get(url("/missing"))).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        network.set_offline(true);
        let err = network.fetch(&Request::get(url("/static/js/main.js"))).await;
        assert!(matches!(err, Err(NetError::Offline)));
        assert_eq!(network.hits(), 3);
        assert_eq!(network.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn test_http_network_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/css/main.css"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body{}"))
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let network = HttpNetwork::new().unwrap().with_origin(base.clone());
        let request = Request::get(base.join("/static/css/main.css").unwrap());
        let response = network.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"body{}");
        assert_eq!(response.response_type, ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_http_network_marks_cross_origin_no_cors_opaque() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("img"))
            .mount(&server)
            .await;

        let network = HttpNetwork::new()
            .unwrap()
            .with_origin(Url::parse("https://pantry.test").unwrap());
        let request = Request::get(Url::parse(&server.uri()).unwrap().join("/logo.png").unwrap())
            .mode(RequestMode::NoCors);
        let response = network.fetch(&request).await.unwrap();

        assert!(response.is_opaque());
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_http_network_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token"))
            .expect(1)
            .mount(&server)
            .await;

        let network = HttpNetwork::new().unwrap();
        let request = Request::post(
            Url::parse(&server.uri()).unwrap().join("/api/auth/refresh").unwrap(),
            bytes::Bytes::from_static(b"{}"),
        );
        let response = network.fetch(&request).await.unwrap();
        assert_eq!(&response.body[..], b"token");
    }
}
