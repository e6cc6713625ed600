//! The web server façade.
//!
//! [`WebServer`] is an explicitly constructed context shared (as
//! `Arc<WebServer>`) by the HTTP dispatch layer, the update ticker, and the
//! event and config listeners. It owns the session table, the page registry
//! and the set of live WebSocket clients.
//!
//! Locking is two-level: the client set has its own mutex, separate from
//! each [`PushActor`]'s state lock. Broadcasts snapshot the set and then
//! enqueue into each actor without holding the set lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::auth::{CredentialStore, StaticCredentials};
use crate::command::{self, CommandError, CommandStream};
use crate::config::WebConfig;
use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::events::EventBus;
use crate::metrics::{MetricRegistry, MetricsError};
use crate::pages::{self, PageEntry, PageRegistry};
use crate::params::{ConfigParam, ParamStore};
use crate::pty::{CommandRunner, PtyRunner};
use crate::push::{PushActor, TxJob, WebSocketHandler};
use crate::session::{Session, SessionTable};

/// Early firings within this margin of the ticker period still count.
const TICK_JITTER: Duration = Duration::from_millis(30);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("websocket client limit reached ({0})")]
    TooManyClients(usize),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Live WebSocket clients keyed by connection.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, Arc<PushActor>>>,
    metrics: Arc<MetricRegistry>,
}

impl ClientRegistry {
    fn new(metrics: Arc<MetricRegistry>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, conn: ConnectionId) -> Option<Arc<PushActor>> {
        self.clients.lock().get(&conn).cloned()
    }

    /// Unregister `conn`, release its queue and give back its modifier.
    /// The client's handler finishes on its next cycle and the connection
    /// closes.
    pub fn remove(&self, conn: ConnectionId) -> bool {
        let Some(actor) = self.clients.lock().remove(&conn) else {
            return false;
        };
        actor.release();
        self.metrics.release_modifier(actor.modifier());
        tracing::info!(%conn, clients = self.len(), "websocket client disconnected");
        true
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.clients.lock().keys().copied().collect()
    }

    fn snapshot(&self) -> Vec<Arc<PushActor>> {
        self.clients.lock().values().cloned().collect()
    }
}

/// Membership of one client in the [`ClientRegistry`]; dropping it
/// unregisters the client.
pub struct ClientRegistration {
    clients: Arc<ClientRegistry>,
    conn: ConnectionId,
}

impl Drop for ClientRegistration {
    fn drop(&mut self) {
        self.clients.remove(self.conn);
    }
}

/// External collaborators the server is wired to.
pub struct Collaborators {
    pub metrics: Arc<MetricRegistry>,
    pub params: Arc<ParamStore>,
    pub events: EventBus,
    pub credentials: Arc<dyn CredentialStore>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Collaborators {
    /// Fresh registries, the configured users, and a PTY command runner.
    pub fn from_config(config: &WebConfig) -> Self {
        let runner = match &config.command.shell {
            Some(shell) => PtyRunner::new(shell.clone()),
            None => PtyRunner::default(),
        };
        Self {
            metrics: Arc::new(MetricRegistry::new()),
            params: Arc::new(ParamStore::new()),
            events: EventBus::new(),
            credentials: Arc::new(StaticCredentials::from_config(&config.users)),
            runner: Arc::new(runner),
        }
    }
}

#[derive(Debug, Default)]
struct TickerState {
    last_tick: Option<Instant>,
    last_session_check: Option<Instant>,
}

pub struct WebServer {
    config: WebConfig,
    sessions: Mutex<SessionTable>,
    pages: RwLock<PageRegistry>,
    clients: Arc<ClientRegistry>,
    metrics: Arc<MetricRegistry>,
    params: Arc<ParamStore>,
    events: EventBus,
    credentials: Arc<dyn CredentialStore>,
    runner: Arc<dyn CommandRunner>,
    ticker: Mutex<TickerState>,
}

impl WebServer {
    /// Build the server and register the built-in pages.
    pub fn new(config: WebConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            metrics,
            params,
            events,
            credentials,
            runner,
        } = collaborators;
        let sessions = SessionTable::new(config.sessions.capacity, config.sessions.ttl());
        let mut registry = PageRegistry::new();
        pages::register_builtin(&mut registry);
        Self {
            config,
            sessions: Mutex::new(sessions),
            pages: RwLock::new(registry),
            clients: Arc::new(ClientRegistry::new(metrics.clone())),
            metrics,
            params,
            events,
            credentials,
            runner,
            ticker: Mutex::new(TickerState::default()),
        }
    }

    pub fn config(&self) -> &WebConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    pub fn params(&self) -> &Arc<ParamStore> {
        &self.params
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Start a session. `None` when the table is full; the request stays
    /// anonymous.
    pub fn create_session(&self) -> Option<Session> {
        let session = self.sessions.lock().create(Instant::now());
        if session.is_none() {
            tracing::warn!("session table full, login refused");
        }
        session
    }

    pub fn get_session(&self, headers: &HeaderMap) -> Option<Session> {
        self.sessions.lock().get_from_headers(headers, Instant::now())
    }

    pub fn destroy_session(&self, session: &Session) -> bool {
        self.sessions.lock().destroy(session)
    }

    pub fn check_sessions(&self) -> usize {
        self.check_sessions_at(Instant::now())
    }

    fn check_sessions_at(&self, now: Instant) -> usize {
        let removed = self.sessions.lock().check(now);
        if removed > 0 {
            tracing::debug!(removed, "expired sessions swept");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn check_login(&self, user: &str, password: &str) -> bool {
        self.credentials.verify(user, password)
    }

    // ── Pages ──────────────────────────────────────────────────────

    /// Register a page. A page already registered under the same URI is
    /// replaced.
    pub fn register_page(&self, entry: PageEntry) {
        self.pages.write().register(entry);
    }

    pub fn deregister_page(&self, uri: &str) -> bool {
        self.pages.write().deregister(uri)
    }

    pub fn find_page(&self, uri: &str) -> Option<PageEntry> {
        self.pages.read().find(uri).cloned()
    }

    pub fn pages(&self) -> Vec<PageEntry> {
        self.pages.read().entries().to_vec()
    }

    // ── WebSocket clients ──────────────────────────────────────────

    /// Create the push handler for a WebSocket connection and register it.
    ///
    /// The handler starts with a full metrics snapshot queued. Dropping it
    /// unregisters the client.
    pub fn create_websocket_handler(&self, conn: &Connection) -> Result<WebSocketHandler, ServerError> {
        let max = self.config.websocket.max_clients;
        let actor = {
            let mut clients = self.clients.clients.lock();
            if clients.len() >= max {
                tracing::warn!(conn = %conn.id(), max, "websocket client refused, limit reached");
                return Err(ServerError::TooManyClients(max));
            }
            let modifier = self.metrics.register_modifier()?;
            let actor = Arc::new(PushActor::new(
                conn.id(),
                modifier,
                self.metrics.clone(),
                conn.poll_handle(),
                &self.config.websocket.actor_config(),
            ));
            clients.insert(conn.id(), actor.clone());
            actor
        };
        tracing::info!(conn = %conn.id(), clients = self.clients.len(), "websocket client connected");

        let registration = ClientRegistration {
            clients: self.clients.clone(),
            conn: conn.id(),
        };
        Ok(WebSocketHandler::new(actor, registration))
    }

    pub fn destroy_websocket_handler(&self, conn: ConnectionId) -> bool {
        self.clients.remove(conn)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn broadcast(&self, job: TxJob) -> usize {
        let actors = self.clients.snapshot();
        for actor in &actors {
            actor.add_tx_job(job.clone(), true);
        }
        actors.len()
    }

    /// Queue a metrics job for every client. Returns the number of clients.
    pub fn broadcast_metrics(&self, update_all: bool) -> usize {
        self.broadcast(if update_all {
            TxJob::MetricsAll
        } else {
            TxJob::MetricsUpdate
        })
    }

    /// Send `msg` to every client as is.
    pub fn broadcast_message(&self, msg: &str) -> usize {
        self.broadcast(TxJob::Message(msg.to_string()))
    }

    pub fn broadcast_event(&self, event: &str) -> usize {
        self.broadcast(TxJob::Event(event.to_string()))
    }

    /// Announce a parameter change. Clients hold a weak reference; a version
    /// replaced before a client gets to it is skipped for that client.
    pub fn config_changed(&self, param: &Arc<ConfigParam>) -> usize {
        self.broadcast(TxJob::config(param))
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Start `command` with its output streamed to `conn`.
    pub fn stream_command(&self, command: &str, verbosity: usize, conn: &Connection) -> CommandStream {
        CommandStream::spawn(
            command,
            verbosity,
            self.runner.clone(),
            conn.poll_handle(),
            self.config.command.queue_capacity,
            true,
        )
    }

    pub async fn execute_command(&self, command: &str, verbosity: usize) -> Result<String, CommandError> {
        command::execute_command(self.runner.clone(), command, verbosity).await
    }

    // ── Ticker ─────────────────────────────────────────────────────

    /// One update-ticker cycle: push a metrics update to every client and
    /// sweep sessions when the check interval has passed.
    ///
    /// Returns `false` if called again before the ticker period elapsed.
    pub fn tick(&self, now: Instant) -> bool {
        let period = self.config.ticker.update_interval();
        let sweep = {
            let mut ticker = self.ticker.lock();
            if let Some(last) = ticker.last_tick {
                if now < last + period.saturating_sub(TICK_JITTER) {
                    tracing::trace!("duplicate ticker firing ignored");
                    return false;
                }
            }
            ticker.last_tick = Some(now);
            let due = ticker
                .last_session_check
                .map_or(true, |last| now.saturating_duration_since(last) >= self.config.sessions.check_interval());
            if due {
                ticker.last_session_check = Some(now);
            }
            due
        };

        self.broadcast_metrics(false);
        if sweep {
            self.check_sessions_at(now);
        }
        true
    }

    pub fn spawn_update_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        let period = self.config.ticker.update_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    now = interval.tick() => {
                        server.tick(now);
                    }
                }
            }
            tracing::debug!("update ticker stopped");
        })
    }

    /// Forward event-bus events to clients. `ticker.*` events stay local.
    pub fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(event) => {
                            if !event.starts_with("ticker.") {
                                server.broadcast_event(&event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("event listener stopped");
        })
    }

    pub fn spawn_config_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        let mut rx = self.params.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(param) => {
                            server.config_changed(&param);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "config listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("config listener stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::ConnEvent;
    use crate::pages::{PageAuth, PageMenu};

    pub(crate) fn test_server_with(config: WebConfig) -> WebServer {
        let runner = |command: &str, shell: &mut dyn crate::command::Shell| -> Result<(), CommandError> {
            shell.puts(&format!("ran {command}"))?;
            Ok(())
        };
        test_server_with_runner(config, Arc::new(runner))
    }

    pub(crate) fn test_server_with_runner(config: WebConfig, runner: Arc<dyn CommandRunner>) -> WebServer {
        WebServer::new(
            config,
            Collaborators {
                metrics: Arc::new(MetricRegistry::new()),
                params: Arc::new(ParamStore::new()),
                events: EventBus::new(),
                credentials: Arc::new(StaticCredentials::new([(
                    "admin".to_string(),
                    "secret".to_string(),
                )])),
                runner,
            },
        )
    }

    pub(crate) fn test_server() -> WebServer {
        test_server_with(WebConfig::default())
    }

    /// Drain everything a client's connection has pending.
    fn drain(conn: &mut Connection) -> Vec<String> {
        let mut messages = Vec::new();
        let mut current = Vec::new();
        conn.dispatch(ConnEvent::Poll);
        while let Some(chunk) = conn.take_outbound() {
            current.extend_from_slice(&chunk.data);
            if chunk.fin {
                messages.push(String::from_utf8(std::mem::take(&mut current)).unwrap());
            }
            conn.dispatch(ConnEvent::Sent(chunk.data.len()));
        }
        messages
    }

    fn connect(server: &WebServer) -> Connection {
        let mut conn = Connection::new();
        let handler = server.create_websocket_handler(&conn).unwrap();
        conn.attach(Box::new(handler)).unwrap();
        conn
    }

    #[test]
    fn client_registration_follows_connection_lifetime() {
        let server = test_server();
        let conn = connect(&server);
        assert_eq!(server.client_count(), 1);
        drop(conn);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn client_limit_is_enforced() {
        let mut config = WebConfig::default();
        config.websocket.max_clients = 2;
        let server = test_server_with(config);
        let _a = connect(&server);
        let _b = connect(&server);
        let conn = Connection::new();
        assert!(matches!(
            server.create_websocket_handler(&conn),
            Err(ServerError::TooManyClients(2))
        ));
    }

    #[test]
    fn modifiers_are_recycled() {
        let server = test_server();
        for _ in 0..(crate::metrics::MAX_MODIFIERS + 4) {
            let conn = connect(&server);
            drop(conn);
        }
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn destroy_websocket_handler_releases_actor() {
        let server = test_server();
        let conn = connect(&server);
        let actor = server.clients().get(conn.id()).unwrap();
        assert!(server.destroy_websocket_handler(conn.id()));
        assert!(!actor.add_tx_job(TxJob::MetricsUpdate, false));
        assert!(!server.destroy_websocket_handler(conn.id()));
    }

    #[test]
    fn broadcast_message_is_delivered_raw() {
        let server = test_server();
        let mut a = connect(&server);
        let mut b = connect(&server);
        drain(&mut a);
        drain(&mut b);

        assert_eq!(server.broadcast_message("notify: charge complete"), 2);
        for conn in [&mut a, &mut b] {
            assert_eq!(drain(conn), vec!["notify: charge complete".to_string()]);
        }
    }

    #[test]
    fn destroyed_client_handler_finishes_and_closes() {
        let server = test_server();
        server.metrics().set("v.b.soc", 80);
        let mut conn = connect(&server);
        drain(&mut conn);

        assert!(server.destroy_websocket_handler(conn.id()));
        assert_eq!(server.broadcast_event("vehicle.locked"), 0);
        conn.dispatch(ConnEvent::Poll);

        assert!(!conn.has_handler());
        assert!(conn.is_closing());
        assert!(conn.take_outbound().is_none());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let server = test_server();
        server.metrics().set("v.b.soc", 80);
        let mut a = connect(&server);
        let mut b = connect(&server);
        drain(&mut a);
        drain(&mut b);

        assert_eq!(server.broadcast_event("vehicle.locked"), 2);
        server.metrics().set("v.b.soc", 81);
        server.broadcast_metrics(false);

        for conn in [&mut a, &mut b] {
            let msgs = drain(conn);
            assert_eq!(msgs.len(), 2);
            assert!(msgs[0].contains("vehicle.locked"));
            let v: serde_json::Value = serde_json::from_str(&msgs[1]).unwrap();
            assert_eq!(v["metrics"]["v.b.soc"], 81);
        }
    }

    #[test]
    fn config_change_reaches_clients() {
        let server = test_server();
        let mut conn = connect(&server);
        drain(&mut conn);
        let param = server.params().set_value("vehicle", "id", "TEST1");
        server.config_changed(&param);
        let msgs = drain(&mut conn);
        assert_eq!(msgs.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(v["config"]["vehicle"]["id"], "TEST1");
    }

    #[tokio::test(start_paused = true)]
    async fn tick_ignores_duplicate_firing() {
        let server = test_server();
        let t0 = Instant::now();
        assert!(server.tick(t0));
        assert!(!server.tick(t0 + Duration::from_millis(10)));
        assert!(server.tick(t0 + Duration::from_millis(980)));
        assert!(server.tick(t0 + Duration::from_millis(2000)));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_sweeps_sessions_on_interval() {
        let mut config = WebConfig::default();
        config.sessions.ttl_secs = 5;
        config.sessions.check_interval_secs = 60;
        let server = test_server_with(config);

        let t0 = Instant::now();
        server.tick(t0);
        server.create_session().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        server.tick(Instant::now());
        // Expired, but the sweep is not due yet.
        assert_eq!(server.session_count(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        server.tick(Instant::now());
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn event_listener_skips_ticker_events() {
        let server = Arc::new(test_server());
        let mut conn = connect(&server);
        drain(&mut conn);

        let cancel = CancellationToken::new();
        let listener = server.spawn_event_listener(cancel.clone());
        server.events().signal("ticker.1");
        server.events().signal("vehicle.charge.start");

        let actor = server.clients().get(conn.id()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while actor.queued() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        listener.await.unwrap();

        let msgs = drain(&mut conn);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("vehicle.charge.start"));
    }

    #[tokio::test]
    async fn config_listener_forwards_changes() {
        let server = Arc::new(test_server());
        let mut conn = connect(&server);
        drain(&mut conn);

        let cancel = CancellationToken::new();
        let listener = server.spawn_config_listener(cancel.clone());
        server.params().set_value("xrt", "units", "metric");

        let actor = server.clients().get(conn.id()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while actor.queued() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        listener.await.unwrap();

        let msgs = drain(&mut conn);
        assert!(msgs[0].contains("metric"));
    }

    #[test]
    fn pages_can_be_registered_and_removed() {
        let server = test_server();
        server.register_page(PageEntry::new(
            "/vehicle/status",
            "Status",
            PageMenu::Vehicle,
            PageAuth::Cookie,
            |_, ctx| ctx.print("ok"),
        ));
        let page = server.find_page("/vehicle/status").unwrap();
        assert_eq!(page.label, "Status");
        assert!(server.deregister_page("/vehicle/status"));
        assert!(server.find_page("/vehicle/status").is_none());
        assert!(server.find_page("/login").is_some());
    }

    #[test]
    fn login_checks_credentials() {
        let server = test_server();
        assert!(server.check_login("admin", "secret"));
        assert!(!server.check_login("admin", "nope"));
    }
}
