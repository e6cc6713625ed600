use std::borrow::Cow;
use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{header, Method};
use axum::response::Response;
use bytes::Bytes;
use rust_embed::Embed;

use super::error::ApiError;
use super::AppState;
use crate::pages::PageContext;

#[derive(Embed)]
#[folder = "assets/"]
struct WebAssets;

/// Serve an embedded file through a [`DataSender`](crate::sender::DataSender).
pub(super) async fn asset(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let file = WebAssets::get(&path).ok_or(ApiError::NotFound)?;
    let data = match file.data {
        Cow::Borrowed(bytes) => Bytes::from_static(bytes),
        Cow::Owned(bytes) => Bytes::from(bytes),
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let mut ctx = PageContext::new(
        state.server.clone(),
        Method::GET,
        format!("/assets/{path}"),
        HashMap::new(),
        None,
    );
    ctx.set_header(header::CACHE_CONTROL, "max-age=3600");
    ctx.send_data(data, mime.as_ref());
    Ok(ctx.into_response().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assets_include_client_script() {
        let file = WebAssets::get("app.js");
        assert!(file.is_some(), "assets/app.js should be embedded");
    }

    #[test]
    fn assets_include_stylesheet() {
        let file = WebAssets::get("style.css").unwrap();
        let content = std::str::from_utf8(&file.data).unwrap();
        assert!(content.contains("body"));
    }
}
