//! HTTP challenge-response negotiation (RFC 7616 Digest, RFC 7617 Basic).
//!
//! [`DigestChallenge::authorization`] is a pure computation: for a fixed
//! nonce count and client nonce it always produces the same header value.
//! [`DigestSession`] adds the only piece of state a long-lived Digest
//! client needs, the per-nonce request counter.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use rand::RngCore;
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};

use crate::error::Error;

// ── Challenge types ──────────────────────────────────────────────────

/// A parsed `Digest` challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Selected quality of protection. Only `auth` is supported;
    /// `None` means the device uses the RFC 2069 form.
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

/// The challenge a device answered a 401 with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Digest(DigestChallenge),
    Basic { realm: Option<String> },
}

impl AuthChallenge {
    /// Pick the strongest challenge among all `WWW-Authenticate` headers.
    ///
    /// Digest wins over Basic. A 401 without any supported challenge is
    /// an authentication failure.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Error> {
        let mut basic = None;
        let mut rejected = Vec::new();

        for value in headers.get_all(WWW_AUTHENTICATE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            match Self::parse(value) {
                Ok(challenge @ Self::Digest(_)) => return Ok(challenge),
                Ok(challenge @ Self::Basic { .. }) => basic = Some(challenge),
                Err(e @ Error::MalformedChallenge { .. }) => return Err(e),
                Err(_) => rejected.push(value.to_owned()),
            }
        }

        basic.ok_or_else(|| Error::Authentication {
            message: if rejected.is_empty() {
                "device returned 401 without a WWW-Authenticate challenge".into()
            } else {
                format!("unsupported authentication scheme: {}", rejected.join("; "))
            },
        })
    }

    /// Parse a single `WWW-Authenticate` header value.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let value = value.trim();
        let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));

        if scheme.eq_ignore_ascii_case("digest") {
            DigestChallenge::parse_params(params).map(Self::Digest)
        } else if scheme.eq_ignore_ascii_case("basic") {
            let realm = parse_params(params)
                .into_iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("realm"))
                .map(|(_, v)| v);
            Ok(Self::Basic { realm })
        } else {
            Err(Error::Authentication {
                message: format!("unsupported authentication scheme '{scheme}'"),
            })
        }
    }
}

impl DigestChallenge {
    /// Parse the parameter list that follows the `Digest` scheme token.
    pub fn parse_params(params: &str) -> Result<Self, Error> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_offered = None;
        let mut algorithm = None;

        for (key, value) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_offered = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        let realm = realm.ok_or(Error::MalformedChallenge { missing: "realm" })?;
        let nonce = nonce
            .filter(|n| !n.is_empty())
            .ok_or(Error::MalformedChallenge { missing: "nonce" })?;

        let qop = match qop_offered {
            None => None,
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_owned())
                } else {
                    return Err(Error::Authentication {
                        message: format!("unsupported digest qop '{offered}'"),
                    });
                }
            }
        };

        if let Some(alg) = algorithm.as_deref() {
            if !alg.eq_ignore_ascii_case("md5") && !alg.eq_ignore_ascii_case("md5-sess") {
                return Err(Error::Authentication {
                    message: format!("unsupported digest algorithm '{alg}'"),
                });
            }
        }

        Ok(Self {
            realm,
            nonce,
            opaque,
            qop,
            algorithm,
        })
    }

    /// Compute the `response` hash for one request.
    pub fn response(&self, req: &DigestRequest<'_>) -> String {
        let mut ha1 = md5_hex(&format!("{}:{}:{}", req.username, self.realm, req.password));
        if self.is_session_algorithm() {
            ha1 = md5_hex(&format!("{ha1}:{}:{}", self.nonce, req.cnonce));
        }
        let ha2 = md5_hex(&format!("{}:{}", req.method, req.uri));

        match self.qop.as_deref() {
            Some(qop) => md5_hex(&format!(
                "{ha1}:{}:{}:{}:{qop}:{ha2}",
                self.nonce,
                format_nc(req.nc),
                req.cnonce
            )),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        }
    }

    /// Build the full `Authorization` header value for one request.
    pub fn authorization(&self, req: &DigestRequest<'_>) -> String {
        let response = self.response(req);
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            req.username, self.realm, self.nonce, req.uri
        );
        if let Some(ref qop) = self.qop {
            header.push_str(&format!(
                ", qop={qop}, nc={}, cnonce=\"{}\"",
                format_nc(req.nc),
                req.cnonce
            ));
        }
        header.push_str(&format!(", response=\"{response}\""));
        if let Some(ref opaque) = self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if let Some(ref algorithm) = self.algorithm {
            header.push_str(&format!(", algorithm={algorithm}"));
        }
        header
    }

    fn is_session_algorithm(&self) -> bool {
        self.algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("md5-sess"))
    }
}

/// Inputs for one Digest-authenticated request.
#[derive(Debug, Clone, Copy)]
pub struct DigestRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub nc: u32,
    pub cnonce: &'a str,
}

// ── Nonce counting ───────────────────────────────────────────────────

/// A cached Digest challenge plus the request counter for its nonce.
///
/// Every request under the same nonce gets the next `nc`; replacing the
/// challenge (a new 401) starts over at 1.
#[derive(Debug, Clone)]
pub struct DigestSession {
    challenge: DigestChallenge,
    nc: u32,
}

impl DigestSession {
    pub fn new(challenge: DigestChallenge) -> Self {
        Self { challenge, nc: 0 }
    }

    pub fn challenge(&self) -> &DigestChallenge {
        &self.challenge
    }

    /// Requests signed so far under the current nonce.
    pub fn nonce_count(&self) -> u32 {
        self.nc
    }

    /// Sign the next request with a fresh client nonce.
    pub fn next_authorization(
        &mut self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
    ) -> String {
        self.nc = self.nc.wrapping_add(1);
        let cnonce = generate_cnonce();
        self.challenge.authorization(&DigestRequest {
            method,
            uri,
            username,
            password,
            nc: self.nc,
            cnonce: &cnonce,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// `Authorization` value for Basic auth.
pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

/// Random 16-hex-digit client nonce.
pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

fn format_nc(nc: u32) -> String {
    format!("{nc:08x}")
}

/// Split `k=v, k="v, with comma"` into pairs, unquoting values.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_owned();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    _ => out.push(c),
                }
            }
            value = out;
            rest = &quoted[end.min(quoted.len())..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_owned();
            rest = &rest[end..];
        }

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        if !key.is_empty() {
            pairs.push((key, value));
        }
    }

    pairs
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn challenge() -> DigestChallenge {
        DigestChallenge::parse_params(r#"realm="R", nonce="N1", qop="auth""#).unwrap()
    }

    fn request<'a>(password: &'a str, cnonce: &'a str) -> DigestRequest<'a> {
        DigestRequest {
            method: "GET",
            uri: "/ISAPI/System/capabilities",
            username: "admin",
            password,
            nc: 1,
            cnonce,
        }
    }

    #[test]
    fn parses_full_digest_challenge() {
        let parsed = AuthChallenge::parse(
            r#"Digest realm="DS-K1T", qop="auth,auth-int", nonce="abc==", opaque="o1", algorithm=MD5"#,
        )
        .unwrap();

        assert_eq!(
            parsed,
            AuthChallenge::Digest(DigestChallenge {
                realm: "DS-K1T".into(),
                nonce: "abc==".into(),
                opaque: Some("o1".into()),
                qop: Some("auth".into()),
                algorithm: Some("MD5".into()),
            })
        );
    }

    #[test]
    fn quoted_values_may_contain_commas() {
        let parsed = DigestChallenge::parse_params(r#"realm="a, b", nonce="n""#).unwrap();
        assert_eq!(parsed.realm, "a, b");
        assert_eq!(parsed.nonce, "n");
    }

    #[test]
    fn missing_realm_or_nonce_is_malformed() {
        assert!(matches!(
            DigestChallenge::parse_params(r#"nonce="n""#),
            Err(Error::MalformedChallenge { missing: "realm" })
        ));
        assert!(matches!(
            DigestChallenge::parse_params(r#"realm="r""#),
            Err(Error::MalformedChallenge { missing: "nonce" })
        ));
    }

    #[test]
    fn basic_challenge_is_recognised() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="device""#).unwrap(),
            AuthChallenge::Basic {
                realm: Some("device".into())
            }
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            AuthChallenge::parse("Bearer realm=\"x\""),
            Err(Error::Authentication { .. })
        ));
    }

    #[test]
    fn response_is_reproducible_for_fixed_inputs() {
        let c = challenge();
        let first = c.response(&request("pw1", "0a4f113b"));
        let second = c.response(&request("pw1", "0a4f113b"));
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn response_changes_with_password() {
        let c = challenge();
        assert_ne!(
            c.response(&request("pw1", "0a4f113b")),
            c.response(&request("pw2", "0a4f113b"))
        );
    }

    #[test]
    fn matches_rfc_2617_reference_vector() {
        // RFC 2617 §3.5 example.
        let c = DigestChallenge::parse_params(
            r#"realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        let response = c.response(&DigestRequest {
            method: "GET",
            uri: "/dir/index.html",
            username: "Mufasa",
            password: "Circle Of Life",
            nc: 1,
            cnonce: "0a4f113b",
        });
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn authorization_header_shape() {
        let header = challenge().authorization(&request("pw1", "abcdef0123456789"));
        assert!(header.starts_with(r#"Digest username="admin", realm="R", nonce="N1", uri="/ISAPI/System/capabilities""#));
        assert!(header.contains("qop=auth, nc=00000001, cnonce=\"abcdef0123456789\""));
        assert!(!header.contains("opaque"));
    }

    #[test]
    fn rfc_2069_form_omits_qop_fields() {
        let c = DigestChallenge::parse_params(r#"realm="R", nonce="N1""#).unwrap();
        let header = c.authorization(&request("pw1", "x"));
        assert!(!header.contains("nc="));
        assert!(!header.contains("cnonce"));
    }

    #[test]
    fn session_counts_requests_per_nonce() {
        let mut session = DigestSession::new(challenge());
        let first = session.next_authorization("GET", "/a", "admin", "pw1");
        let second = session.next_authorization("GET", "/a", "admin", "pw1");
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert_eq!(session.nonce_count(), 2);
    }

    #[test]
    fn basic_header_encodes_credentials() {
        assert_eq!(basic_authorization("admin", "pw1"), "Basic YWRtaW46cHcx");
    }
}
