use std::collections::HashMap;

use axum::{
    extract::{rejection::FormRejection, ws::WebSocketUpgrade, Form, Query, State},
    http::{HeaderMap, Method, Uri},
    response::Response,
};

use crate::connection::Connection;
use crate::io;
use crate::pages::PageContext;
use crate::server::ServerError;

use super::auth;
use super::error::ApiError;
use super::AppState;

/// Dispatch a request to the registered page for its path.
pub(super) async fn page(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(mut vars): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Result<Response, ApiError> {
    let path = uri.path().to_string();
    let entry = state.server.find_page(&path).ok_or(ApiError::NotFound)?;
    let session = state.server.get_session(&headers);
    auth::authorize(&state.server, entry.auth, &headers, session.as_ref())?;

    match form {
        Ok(Form(fields)) => vars.extend(fields),
        // Not a form post; query variables only.
        Err(FormRejection::InvalidFormContentType(_)) => {}
        Err(rejection) => return Err(ApiError::InvalidRequest(rejection.body_text())),
    }
    tracing::debug!(%method, path, page = %entry.label, "page request");

    let mut ctx = PageContext::new(state.server.clone(), method, path, vars, session);
    (entry.handler)(&entry, &mut ctx);
    ctx.done();
    Ok(ctx.into_response().await)
}

/// Upgrade to a live-update WebSocket.
///
/// The push handler is created before the upgrade so a full server answers
/// 503 instead of accepting and dropping the socket.
pub(super) async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let server = &state.server;
    if server.config().websocket.require_session && server.get_session(&headers).is_none() {
        return Err(ApiError::LoginRequired);
    }

    let mut conn = Connection::new();
    let handler = server.create_websocket_handler(&conn)?;
    conn.attach(Box::new(handler)).map_err(ServerError::from)?;

    let (guard, shutdown_rx) = state.shutdown.register();
    Ok(ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        io::run_websocket(socket, conn, shutdown_rx).await;
    }))
}
