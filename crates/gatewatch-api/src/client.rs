// ISAPI HTTP client
//
// Wraps `reqwest::Client` with challenge-response authentication. The
// first request to a device goes out bare; a 401 carries the challenge,
// which is cached so later requests are signed up front. Endpoint
// methods return parsed payloads and leave interpretation to core.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, SET_COOKIE};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace, warn};
use url::{Position, Url};

use crate::digest::{AuthChallenge, DigestSession, basic_authorization};
use crate::error::Error;
use crate::payload::{DeviceInfo, VendorPayload, xml_leaves};
use crate::transport::TransportConfig;

const CAPABILITIES_PATH: &str = "/ISAPI/System/capabilities";
const STATUS_PATH: &str = "/ISAPI/System/status";
const ALERT_STREAM_PATH: &str = "/ISAPI/Event/notification/alertStream";
const LOGOUT_PATH: &str = "/ISAPI/Security/sessionLogout";

/// Username and password for a device.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Which scheme the device asked for, once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// No 401 seen yet.
    None,
    Basic,
    Digest,
}

#[derive(Debug, Default)]
enum AuthState {
    #[default]
    Unnegotiated,
    Basic,
    Digest(DigestSession),
}

/// Result of the capabilities probe.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub device_info: DeviceInfo,
    /// Session cookie value, when the device hands one out.
    pub vendor_token: Option<String>,
    pub scheme: AuthScheme,
}

/// Raw HTTP client for one device's ISAPI surface.
///
/// Safe to share behind an `Arc`: the cached challenge sits behind a
/// mutex that is never held across an await point.
#[derive(Debug)]
pub struct IsapiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    auth: Mutex<AuthState>,
}

impl IsapiClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the device root, e.g. `https://10.0.0.20:443`.
    pub fn new(
        base_url: Url,
        credentials: Credentials,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, credentials))
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url, credentials: Credentials) -> Self {
        Self {
            http,
            base_url,
            credentials,
            auth: Mutex::new(AuthState::Unnegotiated),
        }
    }

    /// The device base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// The negotiated scheme.
    pub fn auth_scheme(&self) -> AuthScheme {
        match *self.auth.lock().expect("auth lock poisoned") {
            AuthState::Unnegotiated => AuthScheme::None,
            AuthState::Basic => AuthScheme::Basic,
            AuthState::Digest(_) => AuthScheme::Digest,
        }
    }

    /// Requests signed under the current Digest nonce, if Digest is active.
    pub fn digest_nonce_count(&self) -> Option<u32> {
        match &*self.auth.lock().expect("auth lock poisoned") {
            AuthState::Digest(session) => Some(session.nonce_count()),
            _ => None,
        }
    }

    /// `Authorization` value for Basic auth with this client's credentials.
    ///
    /// The alert-stream upgrade always uses this.
    pub fn basic_header(&self) -> String {
        basic_authorization(
            &self.credentials.username,
            self.credentials.password.expose_secret(),
        )
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build a full URL for an ISAPI path.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    /// `ws(s)://host/ISAPI/Event/notification/alertStream?format=json`
    pub fn alert_stream_url(&self) -> Result<Url, Error> {
        let mut url = self.endpoint(ALERT_STREAM_PATH)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::WebSocketConnect(format!("cannot derive {scheme} URL")))?;
        url.query_pairs_mut().append_pair("format", "json");
        Ok(url)
    }

    // ── Request core ─────────────────────────────────────────────────

    /// Send a request, answering a 401 challenge once.
    ///
    /// A second 401 after answering means the credentials are wrong.
    pub async fn send(&self, method: Method, url: Url) -> Result<reqwest::Response, Error> {
        let uri = url[Position::BeforePath..].to_owned();
        debug!("{method} {url}");

        let header = self.authorization(method.as_str(), &uri);
        let resp = self.dispatch(method.clone(), url.clone(), header).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = AuthChallenge::from_headers(resp.headers())?;
        self.store_challenge(challenge);

        let header = self.authorization(method.as_str(), &uri);
        let resp = self.dispatch(method, url, header).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            warn!(username = %self.credentials.username, "credentials rejected");
            return Err(Error::Authentication {
                message: format!(
                    "device rejected credentials for user '{}'",
                    self.credentials.username
                ),
            });
        }
        Ok(resp)
    }

    async fn dispatch(
        &self,
        method: Method,
        url: Url,
        authorization: Option<String>,
    ) -> Result<reqwest::Response, Error> {
        let mut builder = self.http.request(method, url);
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        Ok(builder.send().await?)
    }

    fn authorization(&self, method: &str, uri: &str) -> Option<String> {
        let mut state = self.auth.lock().expect("auth lock poisoned");
        match &mut *state {
            AuthState::Unnegotiated => None,
            AuthState::Basic => Some(self.basic_header()),
            AuthState::Digest(session) => Some(session.next_authorization(
                method,
                uri,
                &self.credentials.username,
                self.credentials.password.expose_secret(),
            )),
        }
    }

    fn store_challenge(&self, challenge: AuthChallenge) {
        let next = match challenge {
            AuthChallenge::Digest(challenge) => {
                trace!(realm = %challenge.realm, "caching Digest challenge");
                AuthState::Digest(DigestSession::new(challenge))
            }
            AuthChallenge::Basic { realm } => {
                trace!(realm = ?realm, "device asked for Basic auth");
                AuthState::Basic
            }
        };
        *self.auth.lock().expect("auth lock poisoned") = next;
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// Probe `/ISAPI/System/capabilities`, negotiating auth on the way.
    pub async fn capabilities(&self) -> Result<Capabilities, Error> {
        let url = self.endpoint(CAPABILITIES_PATH)?;
        let resp = check_status(self.send(Method::GET, url).await?).await?;
        let vendor_token = session_cookie(resp.headers());
        let body = resp.text().await?;

        Ok(Capabilities {
            device_info: DeviceInfo::from_body(&body),
            vendor_token,
            scheme: self.auth_scheme(),
        })
    }

    /// Lightweight reachability check against `/ISAPI/System/status`.
    pub async fn status(&self) -> Result<(), Error> {
        let url = self.endpoint(STATUS_PATH)?;
        let resp = check_status(self.send(Method::GET, url).await?).await?;
        // Drain so the connection returns to the pool.
        let _ = resp.bytes().await?;
        Ok(())
    }

    /// Fetch events recorded since `start_time`.
    ///
    /// An empty `event_types` asks for every type.
    pub async fn poll_events(
        &self,
        start_time: DateTime<Utc>,
        event_types: &[String],
    ) -> Result<VendorPayload, Error> {
        let mut url = self.endpoint(ALERT_STREAM_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("format", "json");
            query.append_pair(
                "startTime",
                &start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            if !event_types.is_empty() {
                query.append_pair("eventTypes", &event_types.join(","));
            }
        }

        let resp = check_status(self.send(Method::GET, url).await?).await?;
        let body = resp.text().await?;
        Ok(VendorPayload::parse(&body))
    }

    /// End the device-side session.
    pub async fn logout(&self) -> Result<(), Error> {
        let url = self.endpoint(LOGOUT_PATH)?;
        check_status(self.send(Method::PUT, url).await?).await?;
        Ok(())
    }
}

// ── Response helpers ─────────────────────────────────────────────────

/// Map a non-success status into `Error::Isapi`.
///
/// ISAPI error bodies are `<ResponseStatus>` documents; `subStatusCode`
/// or `statusString` is lifted into the message when present.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = response_status_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_owned()
    });
    Err(Error::Isapi {
        status: status.as_u16(),
        message,
    })
}

fn response_status_message(body: &str) -> Option<String> {
    let leaves = xml_leaves(body.trim()).ok()?;
    ["subStatusCode", "statusString"].iter().find_map(|key| {
        leaves
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    })
}

/// Value of the first `Set-Cookie` pair on the response.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(_, value)| value.trim().to_owned())
        .find(|value| !value.is_empty())
}
