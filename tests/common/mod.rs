#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use telemetry_web::api::{self, auth::StaticCredentials};
use telemetry_web::command::{CommandError, Shell};
use telemetry_web::config::{UserConfig, WebConfig};
use telemetry_web::events::EventBus;
use telemetry_web::metrics::MetricRegistry;
use telemetry_web::params::ParamStore;
use telemetry_web::server::{Collaborators, WebServer};
use telemetry_web::shutdown::ShutdownCoordinator;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const USER: &str = "admin";
pub const PASSWORD: &str = "secret";

/// Default config with one user and a fast update ticker.
pub fn test_config() -> WebConfig {
    let mut config = WebConfig::default();
    config.users.push(UserConfig {
        name: USER.to_string(),
        password: PASSWORD.to_string(),
    });
    config.ticker.update_interval_ms = 100;
    config
}

/// Fresh registries and a runner that prints each `;`-separated part of the
/// command on its own line, so tests don't depend on a real shell.
pub fn collaborators(config: &WebConfig) -> Collaborators {
    let runner = |command: &str, shell: &mut dyn Shell| -> Result<(), CommandError> {
        for part in command.split(';') {
            shell.puts(part.trim())?;
        }
        Ok(())
    };
    Collaborators {
        metrics: Arc::new(MetricRegistry::new()),
        params: Arc::new(ParamStore::new()),
        events: EventBus::new(),
        credentials: Arc::new(StaticCredentials::from_config(&config.users)),
        runner: Arc::new(runner),
    }
}

pub fn test_server(config: WebConfig) -> WebServer {
    let collaborators = collaborators(&config);
    WebServer::new(config, collaborators)
}

/// A server listening on an ephemeral loopback port with its background
/// tasks running. Dropping it stops everything.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<WebServer>,
    pub shutdown: ShutdownCoordinator,
    cancel: CancellationToken,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        self.cancel.cancel();
    }
}

pub async fn start_server(config: WebConfig) -> TestServer {
    let server = Arc::new(test_server(config));
    let shutdown = ShutdownCoordinator::new();
    let cancel = CancellationToken::new();

    server.spawn_update_ticker(cancel.clone());
    server.spawn_event_listener(cancel.clone());
    server.spawn_config_listener(cancel.clone());

    let app = api::router(api::AppState {
        server: server.clone(),
        shutdown: shutdown.clone(),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
            .unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        server,
        shutdown,
        cancel,
    }
}

/// HTTP client that leaves redirects to the test.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Log in and return the `name=value` cookie pair.
pub async fn login(ts: &TestServer) -> String {
    let response = http_client()
        .post(ts.url("/login"))
        .form(&[("username", USER), ("password", PASSWORD)])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 303);
    let set_cookie = response
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .expect("login should set a cookie")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}
