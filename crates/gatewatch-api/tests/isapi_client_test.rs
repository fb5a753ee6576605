#![allow(clippy::unwrap_used)]
// Integration tests for `IsapiClient` using wiremock.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use url::Url;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatewatch_api::digest::DigestRequest;
use gatewatch_api::{AuthScheme, Credentials, DigestChallenge, Error, IsapiClient, VendorPayload};

// ── Helpers ─────────────────────────────────────────────────────────

const DIGEST_CHALLENGE: &str =
    r#"Digest realm="DS-K1T671", qop="auth", nonce="4e7a8b2c9d", opaque="5ccc069c403ebaf9""#;

async fn setup() -> (MockServer, IsapiClient) {
    let server = MockServer::start().await;
    let client = IsapiClient::with_client(
        reqwest::Client::new(),
        Url::parse(&server.uri()).unwrap(),
        Credentials {
            username: "admin".into(),
            password: SecretString::from("Passw0rd!"),
        },
    );
    (server, client)
}

/// Mount a 200 for signed requests and a 401 challenge for everything else.
async fn mount_challenge(server: &MockServer, request_path: &str, challenge: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(request_path))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(request_path))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge))
        .mount(server)
        .await;
}

fn digest_fields(header: &str) -> HashMap<String, String> {
    header
        .strip_prefix("Digest ")
        .unwrap()
        .split(", ")
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.trim_matches('"').to_owned()))
        .collect()
}

async fn authorization_headers(server: &MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            r.headers
                .get("authorization")
                .map(|v| v.to_str().unwrap().to_owned())
        })
        .collect()
}

const CAPABILITIES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DeviceCap version="2.0" xmlns="http://www.isapi.org/ver20/XMLSchema">
  <model>DS-K1T671M</model>
  <serialNumber>DS-K1T671M20230101AAWR123456789</serialNumber>
  <firmwareVersion>V3.2.30</firmwareVersion>
</DeviceCap>"#;

// ── Authentication tests ────────────────────────────────────────────

#[tokio::test]
async fn test_digest_challenge_is_answered() {
    let (server, client) = setup().await;
    mount_challenge(&server, "/ISAPI/System/capabilities", DIGEST_CHALLENGE, CAPABILITIES_XML)
        .await;

    let caps = client.capabilities().await.unwrap();

    assert_eq!(caps.scheme, AuthScheme::Digest);
    assert_eq!(caps.device_info.model.as_deref(), Some("DS-K1T671M"));
    assert_eq!(caps.device_info.firmware_version.as_deref(), Some("V3.2.30"));

    let headers = authorization_headers(&server).await;
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0], None, "first request must go out unauthenticated");

    let signed = headers[1].as_deref().unwrap();
    let fields = digest_fields(signed);
    assert_eq!(fields["username"], "admin");
    assert_eq!(fields["realm"], "DS-K1T671");
    assert_eq!(fields["nonce"], "4e7a8b2c9d");
    assert_eq!(fields["uri"], "/ISAPI/System/capabilities");
    assert_eq!(fields["qop"], "auth");
    assert_eq!(fields["nc"], "00000001");
    assert_eq!(fields["opaque"], "5ccc069c403ebaf9");
    assert_eq!(fields["cnonce"].len(), 16);

    let challenge = DigestChallenge::parse_params(
        r#"realm="DS-K1T671", qop="auth", nonce="4e7a8b2c9d", opaque="5ccc069c403ebaf9""#,
    )
    .unwrap();
    let expected = challenge.response(&DigestRequest {
        method: "GET",
        uri: "/ISAPI/System/capabilities",
        username: "admin",
        password: "Passw0rd!",
        nc: 1,
        cnonce: &fields["cnonce"],
    });
    assert_eq!(fields["response"], expected);
}

#[tokio::test]
async fn test_nonce_count_increments_across_requests() {
    let (server, client) = setup().await;
    mount_challenge(&server, "/ISAPI/System/capabilities", DIGEST_CHALLENGE, CAPABILITIES_XML)
        .await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/status"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    client.capabilities().await.unwrap();
    client.status().await.unwrap();
    client.status().await.unwrap();

    assert_eq!(client.digest_nonce_count(), Some(3));

    let headers = authorization_headers(&server).await;
    let counts: Vec<String> = headers
        .iter()
        .flatten()
        .map(|h| digest_fields(h)["nc"].clone())
        .collect();
    assert_eq!(counts, vec!["00000001", "00000002", "00000003"]);
}

#[tokio::test]
async fn test_basic_challenge_is_answered() {
    let (server, client) = setup().await;
    mount_challenge(
        &server,
        "/ISAPI/System/capabilities",
        r#"Basic realm="DS-K1T671""#,
        CAPABILITIES_XML,
    )
    .await;

    let caps = client.capabilities().await.unwrap();
    assert_eq!(caps.scheme, AuthScheme::Basic);

    let headers = authorization_headers(&server).await;
    // admin:Passw0rd!
    assert_eq!(headers[1].as_deref(), Some("Basic YWRtaW46UGFzc3cwcmQh"));
}

#[tokio::test]
async fn test_digest_preferred_over_basic() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CAPABILITIES_XML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .respond_with(
            ResponseTemplate::new(401)
                .append_header("WWW-Authenticate", r#"Basic realm="DS-K1T671""#)
                .append_header("WWW-Authenticate", DIGEST_CHALLENGE),
        )
        .mount(&server)
        .await;

    let caps = client.capabilities().await.unwrap();
    assert_eq!(caps.scheme, AuthScheme::Digest);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", DIGEST_CHALLENGE))
        .mount(&server)
        .await;

    let result = client.capabilities().await;
    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
    // One bare probe, one signed retry, no more.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_401_without_challenge() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client.capabilities().await;
    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
}

#[tokio::test]
async fn test_malformed_digest_challenge() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Digest realm="x""#),
        )
        .mount(&server)
        .await;

    let result = client.capabilities().await;
    assert!(
        matches!(result, Err(Error::MalformedChallenge { missing: "nonce" })),
        "expected MalformedChallenge, got: {result:?}"
    );
}

#[tokio::test]
async fn test_vendor_token_from_cookie() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/capabilities"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "WebSession_8f1a=c0ffee42; path=/; HttpOnly")
                .set_body_string(CAPABILITIES_XML),
        )
        .mount(&server)
        .await;

    let caps = client.capabilities().await.unwrap();
    assert_eq!(caps.scheme, AuthScheme::None);
    assert_eq!(caps.vendor_token.as_deref(), Some("c0ffee42"));
}

// ── ISAPI error mapping ─────────────────────────────────────────────

#[tokio::test]
async fn test_isapi_error_status() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/System/status"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            "<ResponseStatus><statusCode>4</statusCode>\
             <subStatusCode>lowPrivilege</subStatusCode></ResponseStatus>",
        ))
        .mount(&server)
        .await;

    match client.status().await {
        Err(Error::Isapi { status, message }) => {
            assert_eq!(status, 403);
            assert_eq!(message, "lowPrivilege");
        }
        other => panic!("expected Isapi error, got: {other:?}"),
    }
}

// ── Event polling ───────────────────────────────────────────────────

#[tokio::test]
async fn test_poll_events_query_and_shape() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/Event/notification/alertStream"))
        .and(query_param("format", "json"))
        .and(query_param("startTime", "2024-06-15T10:30:00Z"))
        .and(query_param("eventTypes", "AccessControllerEvent,doorOpen"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"events":[
                {"eventType":"AccessControllerEvent","dateTime":"2024-06-15T10:30:05Z",
                 "AccessControllerEvent":{"employeeNoString":"1001","cardNo":"A1B2"}},
                {"eventType":"doorOpen","dateTime":"2024-06-15T10:30:06Z"}
            ]}"#,
        ))
        .mount(&server)
        .await;

    let since = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
    let payload = client
        .poll_events(since, &["AccessControllerEvent".into(), "doorOpen".into()])
        .await
        .unwrap();

    assert!(matches!(payload, VendorPayload::JsonWrapped(_)));
    let events: Vec<_> = payload.into_events().into_iter().map(Result::unwrap).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].card_no.as_deref(), Some("A1B2"));
    assert_eq!(events[1].event_type, "doorOpen");
}

#[tokio::test]
async fn test_poll_events_without_type_filter() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ISAPI/Event/notification/alertStream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let since = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
    let payload = client.poll_events(since, &[]).await.unwrap();
    assert!(payload.into_events().is_empty());

    let requests = server.received_requests().await.unwrap();
    assert!(
        !requests[0]
            .url
            .query_pairs()
            .any(|(k, _)| k == "eventTypes")
    );
}

#[tokio::test]
async fn test_logout_uses_put() {
    let (server, client) = setup().await;
    Mock::given(method("PUT"))
        .and(path("/ISAPI/Security/sessionLogout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client.logout().await.unwrap();
}
