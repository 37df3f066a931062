//! HTTP boundary
//!
//! A deliberately small router in front of the cache. Every route lives
//! under `/<app_name>`; the screenshot route exists only when a renderer was
//! found at startup.

use crate::{
    Config, HealthChecker, ScreenshotCache, ScreenshotError, ScreenshotRequest, Screenshot,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Screenshots,
    Health,
    Metrics,
}

impl Route {
    pub fn segment(&self) -> &'static str {
        match self {
            Route::Screenshots => "/screenshots",
            Route::Health => "/health",
            Route::Metrics => "/metrics",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into().into_bytes(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    pub fn json(value: &impl serde::Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status: 200,
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body,
            },
            Err(e) => Self::from_error(&e.into()),
        }
    }

    pub fn from_error(err: &ScreenshotError) -> Self {
        Self::text(err.status_code(), err.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl From<Screenshot> for HttpResponse {
    fn from(shot: Screenshot) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), shot.content_type.to_string()),
                ("Cache-Control".to_string(), shot.cache_control),
            ],
            body: shot.data,
        }
    }
}

pub struct App {
    context_path: String,
    screenshots: Option<Arc<ScreenshotCache>>,
    health: HealthChecker,
    metrics: Option<PrometheusHandle>,
}

impl App {
    pub fn new(
        config: &Config,
        screenshots: Option<Arc<ScreenshotCache>>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            context_path: config.context_path(),
            health: HealthChecker::new(screenshots.clone()),
            screenshots,
            metrics,
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut routes = Vec::with_capacity(3);
        if self.screenshots.is_some() {
            routes.push(Route::Screenshots);
        }
        routes.push(Route::Health);
        if self.metrics.is_some() {
            routes.push(Route::Metrics);
        }
        routes
    }

    pub fn route(&self, path: &str) -> Option<Route> {
        let rest = path.strip_prefix(&self.context_path)?;
        self.routes()
            .into_iter()
            .find(|route| rest.starts_with(route.segment()))
    }

    /// Answer a request given its method and raw request target.
    pub async fn dispatch(&self, method: &str, target: &str) -> HttpResponse {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let Some(route) = self.route(path) else {
            return HttpResponse::not_found();
        };
        if !method.eq_ignore_ascii_case("GET") {
            return HttpResponse::text(405, "Method Not Allowed");
        }

        match route {
            Route::Screenshots => match &self.screenshots {
                Some(cache) => self.screenshot(cache, query).await,
                None => HttpResponse::not_found(),
            },
            Route::Health => HttpResponse::json(&self.health.check().await),
            Route::Metrics => match &self.metrics {
                Some(handle) => HttpResponse::text(200, handle.render()),
                None => HttpResponse::not_found(),
            },
        }
    }

    async fn screenshot(&self, cache: &Arc<ScreenshotCache>, query: &str) -> HttpResponse {
        let request = match ScreenshotRequest::from_query(query) {
            Ok(request) => request,
            Err(e) => return HttpResponse::from_error(&e),
        };

        // Runs on its own task so a client hanging up does not abort a render.
        let cache = cache.clone();
        let task = tokio::spawn(async move {
            cache
                .get_or_generate(&request.url, request.refresh)
                .await
        });

        match task.await {
            Ok(Ok(shot)) => shot.into(),
            Ok(Err(e)) => {
                if !e.is_client_error() {
                    warn!("Screenshot request failed: {}", e);
                }
                HttpResponse::from_error(&e)
            }
            Err(e) => {
                error!("Screenshot task panicked: {}", e);
                HttpResponse::text(500, "Screenshot task failed")
            }
        }
    }
}

/// Blocking `tiny_http` listener feeding requests into the tokio runtime.
pub struct HttpServer {
    server: Arc<tiny_http::Server>,
}

impl HttpServer {
    pub fn bind(addr: &str) -> Result<Self, ScreenshotError> {
        let server = tiny_http::Server::http(addr)
            .map_err(|e| ScreenshotError::Configuration(format!("could not bind {addr}: {e}")))?;
        Ok(Self {
            server: Arc::new(server),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Stop accepting; `run` returns once the listener wakes up.
    pub fn shutdown(&self) {
        self.server.unblock();
    }

    pub async fn run(&self, app: Arc<App>) -> Result<(), ScreenshotError> {
        if let Some(addr) = self.local_addr() {
            info!("Listening on http://{}{}", addr, app.context_path);
        }

        let server = self.server.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            for request in server.incoming_requests() {
                let app = app.clone();
                runtime.spawn(async move {
                    let method = request.method().to_string();
                    let target = request.url().to_string();
                    let response = app.dispatch(&method, &target).await;
                    debug!("{} {} -> {}", method, target, response.status);

                    let written =
                        tokio::task::spawn_blocking(move || request.respond(to_tiny(response)))
                            .await;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Client went away before the response: {}", e),
                        Err(e) => error!("Response writer failed: {}", e),
                    }
                });
            }
            info!("HTTP listener stopped");
        })
        .await
        .map_err(|e| ScreenshotError::Io(e.to_string()))
    }
}

fn to_tiny(response: HttpResponse) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let mut out = tiny_http::Response::from_data(response.body).with_status_code(response.status);
    for (name, value) in response.headers {
        match tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => out.add_header(header),
            Err(()) => warn!("Dropping malformed header {}", name),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_without_screenshots() -> App {
        App::new(&Config::default(), None, None)
    }

    #[test]
    fn test_screenshot_route_absent_without_renderer() {
        let app = app_without_screenshots();
        assert_eq!(app.routes(), vec![Route::Health]);
        assert_eq!(app.route("/app-runner-home/screenshots"), None);
        assert_eq!(app.route("/app-runner-home/health"), Some(Route::Health));
        assert_eq!(app.route("/health"), None);
    }

    #[tokio::test]
    async fn test_unregistered_screenshot_route_is_not_found() {
        let app = app_without_screenshots();
        let response = app
            .dispatch("GET", "/app-runner-home/screenshots?url=https://example.com/")
            .await;
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"Not Found");
    }

    #[tokio::test]
    async fn test_health_route_returns_json() {
        let app = app_without_screenshots();
        let response = app.dispatch("GET", "/app-runner-home/health").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["screenshots_enabled"], false);
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let app = app_without_screenshots();
        let response = app.dispatch("POST", "/app-runner-home/health").await;
        assert_eq!(response.status, 405);
    }

    #[test]
    fn test_error_responses() {
        let response = HttpResponse::from_error(&ScreenshotError::GenerationFailed(
            "Exit code 1 returned from phantomjs".to_string(),
        ));
        assert_eq!(response.status, 500);
        assert!(String::from_utf8_lossy(&response.body).contains("Exit code 1"));

        let response = HttpResponse::from_error(&ScreenshotError::EmptyUrl);
        assert_eq!(response.status, 404);
    }

    #[test]
    fn test_screenshot_response_headers() {
        let response: HttpResponse = Screenshot {
            key: "httpsexamplecom".to_string(),
            data: b"PNG".to_vec(),
            content_type: "image/png",
            cache_control: "no-store".to_string(),
            generated: true,
        }
        .into();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("Content-Type"), Some("image/png"));
        assert_eq!(response.header("cache-control"), Some("no-store"));
        assert_eq!(response.body, b"PNG");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_answers_over_tcp() {
        use std::io::{Read, Write};

        let server = Arc::new(HttpServer::bind("127.0.0.1:0").unwrap());
        let addr = server.local_addr().unwrap();
        let app = Arc::new(app_without_screenshots());

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run(app).await });

        let response = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET /app-runner-home/nothing HTTP/1.0\r\nHost: localhost\r\n\r\n")
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        })
        .await
        .unwrap();

        assert!(response.starts_with("HTTP/1.0 404") || response.starts_with("HTTP/1.1 404"));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
