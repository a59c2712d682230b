//! Integration tests for the fetch client against a mock HTTP server.

use std::time::Duration;

use harvester_core::fetch::{FetchRequest, RequestProfile};
use harvester_core::{FetchClient, FetchConfig, FetchError, RetryPolicy};
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_string, header, header_regex, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_retry_config() -> FetchConfig {
    FetchConfig {
        retry: RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50), 2.0),
        ..FetchConfig::default()
    }
}

#[tokio::test]
async fn test_gbk_page_decoded_from_content_type() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let (bytes, _, _) = encoding_rs::GBK.encode("<h1>第一章 陨落的天才</h1>");
    Mock::given(method("GET"))
        .and(path("/book/1/1.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html; charset=gbk")
                .set_body_bytes(bytes.into_owned()),
        )
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let response = assert_ok!(client.get(&format!("{}/book/1/1.html", server.uri()), TIMEOUT, None).await);
    assert_eq!(response.encoding, "GBK");
    assert!(response.body.contains("第一章 陨落的天才"));
    assert_eq!(response.profile, "browser");
    assert_eq!(response.attempts, 1);
}

#[tokio::test]
async fn test_meta_charset_used_without_header() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let (bytes, _, _) = encoding_rs::GBK.encode(r#"<html><head><meta charset="gbk"></head><body>斗破苍穹</body></html>"#);
    Mock::given(method("GET"))
        .and(path("/meta"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.into_owned()))
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let response = assert_ok!(client.get(&format!("{}/meta", server.uri()), TIMEOUT, None).await);
    assert!(response.body.contains("斗破苍穹"));
}

#[tokio::test]
async fn test_server_error_is_retried_then_succeeds() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let response = assert_ok!(client.get(&format!("{}/flaky", server.uri()), TIMEOUT, None).await);
    assert_eq!(response.body, "ok");
    assert_eq!(response.attempts, 2);
    assert_eq!(response.profile, "browser");
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let error = assert_err!(client.get(&format!("{}/missing", server.uri()), TIMEOUT, None).await);
    assert!(matches!(error, FetchError::HttpStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_forbidden_falls_back_to_next_profile() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    // Only the desktop browser profile is blocked.
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .and(header_regex("user-agent", "Windows NT"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .respond_with(ResponseTemplate::new(200).set_body_string("mobile page"))
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let response = assert_ok!(client.get(&format!("{}/guarded", server.uri()), TIMEOUT, None).await);
    assert_eq!(response.profile, "compat");
    assert_eq!(response.body, "mobile page");
    assert_eq!(response.attempts, 2);
}

#[tokio::test]
async fn test_exhausted_retries_walk_every_profile() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let error = assert_err!(client.get(&format!("{}/down", server.uri()), TIMEOUT, None).await);
    assert!(matches!(error, FetchError::HttpStatus { status: 502, .. }));

    // Two attempts for each of the three default profiles.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 6);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = FetchClient::new(FetchConfig {
        retry: RetryPolicy::with_max_attempts(1),
        profiles: vec![RequestProfile::plain()],
        ..FetchConfig::default()
    });
    let error = assert_err!(
        client
            .get(&format!("{}/slow", server.uri()), Duration::from_millis(200), None)
            .await
    );
    assert!(error.is_timeout(), "expected timeout, got {error:?}");
}

#[tokio::test]
async fn test_post_sends_form_body_and_referer() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/modules/search.php"))
        .and(body_string("searchkey=%B6%B7%C6%C6"))
        .and(header("referer", "https://demo.example/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("results"))
        .expect(1)
        .mount(&server)
        .await;

    let client = FetchClient::new(fast_retry_config());
    let request = FetchRequest::post(
        format!("{}/modules/search.php", server.uri()),
        "searchkey=%B6%B7%C6%C6",
        TIMEOUT,
    )
    .with_referer(Some("https://demo.example/".to_string()));
    let response = assert_ok!(client.fetch(&request).await);
    assert_eq!(response.body, "results");
}

#[tokio::test]
async fn test_invalid_url_rejected_without_request() {
    let client = FetchClient::new(fast_retry_config());
    let error = assert_err!(client.get("ftp://demo.example/file", TIMEOUT, None).await);
    assert!(matches!(error, FetchError::InvalidUrl { .. }));
}
