use axum::http::{header, HeaderMap};
use base64::Engine;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::config::UserConfig;
use crate::pages::PageAuth;
use crate::server::WebServer;
use crate::session::Session;

/// External credential store consulted for login and `File` auth.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, user: &str, password: &str) -> bool;
}

/// Fixed user list, typically from the config file.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: Vec<(String, String)>,
}

impl StaticCredentials {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    pub fn from_config(users: &[UserConfig]) -> Self {
        Self::new(users.iter().map(|u| (u.name.clone(), u.password.clone())))
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, user: &str, password: &str) -> bool {
        // Check every entry so timing does not reveal which user matched.
        let mut ok = subtle::Choice::from(0u8);
        for (name, secret) in &self.users {
            ok |= name.as_bytes().ct_eq(user.as_bytes()) & secret.as_bytes().ct_eq(password.as_bytes());
        }
        ok.into()
    }
}

/// Extract Basic credentials from the Authorization header.
pub(crate) fn extract_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Authentication gate for a page.
///
/// `None` pages are public. `Cookie` pages need a live session. `File` pages
/// need Basic credentials accepted by the credential store; the session table
/// is not consulted.
pub fn authorize(
    server: &WebServer,
    auth: PageAuth,
    headers: &HeaderMap,
    session: Option<&Session>,
) -> Result<(), ApiError> {
    match auth {
        PageAuth::None => Ok(()),
        PageAuth::Cookie => match session {
            Some(_) => Ok(()),
            None => Err(ApiError::LoginRequired),
        },
        PageAuth::File => {
            let realm = server.config().realm.clone();
            match extract_basic(headers) {
                Some((user, password)) if server.check_login(&user, &password) => Ok(()),
                Some((user, _)) => {
                    tracing::warn!(user = %user, "basic authentication failed");
                    Err(ApiError::AuthInvalid { realm })
                }
                None => Err(ApiError::AuthRequired { realm }),
            }
        }
    }
}
