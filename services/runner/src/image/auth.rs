//! Registry credentials and the bearer-token challenge flow.
//!
//! Credentials come from the caller's pull configuration and are passed
//! through untouched. When a registry answers `401` with a
//! `WWW-Authenticate: Bearer realm=..,service=..,scope=..` challenge, a token
//! is fetched from the realm and the request is retried with it.
//!
//! Reference: <https://distribution.github.io/distribution/spec/auth/token/>

use base64::Engine;
use fnbox_proto::v1::ImagePullAuth;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from credential handling and token exchange.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth string is not valid base64 'username:password'")]
    MalformedAuth,

    #[error("unsupported authentication challenge: {0}")]
    UnsupportedChallenge(String),

    #[error("token request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),

    #[error("token response contained no token")]
    MissingToken,
}

/// Credentials for one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// Refresh token exchanged at the token endpoint.
    IdentityToken(String),
    /// Bearer token sent with every request.
    RegistryToken(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => write!(f, "Basic({username})"),
            Self::IdentityToken(_) => f.write_str("IdentityToken"),
            Self::RegistryToken(_) => f.write_str("RegistryToken"),
        }
    }
}

impl Credentials {
    /// Build credentials from the request's pull auth.
    ///
    /// Precedence: registry token, identity token, username/password, then
    /// the combined base64 `auth` string.
    pub fn from_pull_auth(auth: Option<&ImagePullAuth>) -> Result<Self, AuthError> {
        let Some(auth) = auth else {
            return Ok(Self::Anonymous);
        };

        if !auth.registry_token.is_empty() {
            return Ok(Self::RegistryToken(auth.registry_token.clone()));
        }
        if !auth.identity_token.is_empty() {
            return Ok(Self::IdentityToken(auth.identity_token.clone()));
        }
        if !auth.username.is_empty() {
            return Ok(Self::Basic {
                username: auth.username.clone(),
                password: auth.password.clone(),
            });
        }
        if !auth.auth.is_empty() {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.auth.trim())
                .map_err(|_| AuthError::MalformedAuth)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedAuth)?;
            let (username, password) = decoded.split_once(':').ok_or(AuthError::MalformedAuth)?;
            return Ok(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        Ok(Self::Anonymous)
    }

    /// Attach basic credentials to a request, if there are any.
    pub fn apply_basic(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Basic { username, password } => req.basic_auth(username, Some(password)),
            _ => req,
        }
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::UnsupportedChallenge(header.to_string()));
        }

        let params = parse_params(params);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        let realm = get("realm").ok_or_else(|| AuthError::UnsupportedChallenge(header.to_string()))?;
        Ok(Self::Bearer {
            realm,
            service: get("service"),
            scope: get("scope"),
        })
    }
}

/// Split `key="value", key2=value2` into pairs. Commas inside quotes are
/// part of the value (scopes may list several actions).
fn parse_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        out.push((key.trim().to_string(), value.trim().to_string()));
    }
    out
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Fetch a bearer token for a challenge.
///
/// Identity tokens use the OAuth2 refresh-token grant; everything else uses
/// a `GET` against the realm, with basic auth when credentials are present.
pub async fn fetch_token(
    client: &Client,
    realm: &str,
    service: Option<&str>,
    scope: Option<&str>,
    creds: &Credentials,
) -> Result<String, AuthError> {
    debug!(realm = %realm, service = ?service, scope = ?scope, "Requesting registry token");

    let req = match creds {
        Credentials::IdentityToken(token) => {
            let mut form = vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", token.as_str()),
                ("client_id", "fnbox"),
            ];
            if let Some(service) = service {
                form.push(("service", service));
            }
            if let Some(scope) = scope {
                form.push(("scope", scope));
            }
            client.post(realm).form(&form)
        }
        _ => {
            let mut query = Vec::new();
            if let Some(service) = service {
                query.push(("service", service));
            }
            if let Some(scope) = scope {
                query.push(("scope", scope));
            }
            creds.apply_basic(client.get(realm).query(&query))
        }
    };

    let body: TokenResponse = req.send().await?.error_for_status()?.json().await?;
    body.token
        .or(body.access_token)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}
