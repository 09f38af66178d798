//! Property-based tests using proptest
//!
//! The central property is the codec roundtrip: any well-formed HTTP/1.1
//! message survives serialize-then-parse unchanged (framing headers kept
//! consistent with the body, which is what "well-formed" means).

use bytes::Bytes;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use snitcher_proxy::http_codec::{encode_request, encode_response, MessageStream};
use snitcher_proxy::http_message::{
    Header, Headers, HttpRequest, HttpResponse, RequestTarget, Scheme, Url, Version,
};

fn parse_request_back(bytes: &[u8]) -> HttpRequest {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        MessageStream::new(bytes, 64 * 1024 * 1024)
            .read_request()
            .await
            .unwrap()
            .unwrap()
    })
}

fn parse_response_back(bytes: &[u8]) -> HttpResponse {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        MessageStream::new(bytes, 64 * 1024 * 1024)
            .read_response(false)
            .await
            .unwrap()
    })
}

// Header names that the framing machinery owns; plain generated headers must
// avoid them so the body strategy stays in control.
fn is_reserved_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
}

fn header_name_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9-]{0,14}".prop_filter("reserved header name", |n| !is_reserved_name(n))
}

// Values without leading/trailing spaces, so the single-space trim of the
// parser is the identity.
fn header_value_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[!-~]",
        "[!-~][ -~]{0,28}[!-~]",
    ]
}

fn headers_strategy() -> impl Strategy<Value = Headers> {
    prop::collection::vec((header_name_strategy(), header_value_strategy()), 0..6)
        .prop_map(|pairs| pairs.into_iter().collect::<Headers>())
}

fn method_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"])
        .prop_map(|s| s.to_string())
}

fn path_strategy() -> impl Strategy<Value = String> {
    "(/[a-z0-9._~-]{1,8}){0,4}".prop_map(|p| if p.is_empty() { "/".to_string() } else { p })
}

fn query_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        "[a-z0-9=&%]{1,16}".prop_map(Some),
    ]
}

fn url_strategy() -> impl Strategy<Value = Url> {
    (
        prop::sample::select(vec![Scheme::Http, Scheme::Https]),
        "[a-z][a-z0-9-]{0,10}(\\.[a-z]{2,4}){0,2}",
        prop_oneof![Just(None), (1u16..=65535).prop_map(Some)],
        path_strategy(),
        query_strategy(),
    )
        .prop_map(|(scheme, host, port, path, query)| Url {
            port: port.unwrap_or(scheme.default_port()),
            scheme,
            host,
            path,
            query,
        })
}

fn target_strategy() -> impl Strategy<Value = RequestTarget> {
    prop_oneof![
        (path_strategy(), query_strategy()).prop_map(|(path, query)| {
            let path_and_query = match query {
                Some(q) => format!("{path}?{q}"),
                None => path,
            };
            RequestTarget::Origin { path_and_query }
        }),
        url_strategy().prop_map(RequestTarget::Absolute),
    ]
}

/// Body plus a framing header that matches it: either `Content-Length` or
/// chunked transfer coding.
fn body_strategy() -> impl Strategy<Value = (Bytes, Header)> {
    (prop::collection::vec(any::<u8>(), 0..200), any::<bool>()).prop_map(|(body, chunked)| {
        let header = if chunked {
            Header {
                name: "Transfer-Encoding".to_string(),
                value: "chunked".to_string(),
            }
        } else {
            Header {
                name: "Content-Length".to_string(),
                value: body.len().to_string(),
            }
        };
        (Bytes::from(body), header)
    })
}

fn request_strategy() -> impl Strategy<Value = HttpRequest> {
    (
        method_strategy(),
        target_strategy(),
        headers_strategy(),
        body_strategy(),
    )
        .prop_map(|(method, target, mut headers, (body, framing))| {
            headers.push(framing.name, framing.value);
            HttpRequest {
                method,
                target,
                version: Version::Http11,
                headers,
                body,
            }
        })
}

fn reason_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("OK".to_string()),
        "[A-Za-z][A-Za-z ]{0,10}[A-Za-z]",
    ]
}

fn response_strategy() -> impl Strategy<Value = HttpResponse> {
    (
        (200u16..=599).prop_filter("status with a body", |s| *s != 204 && *s != 304),
        reason_strategy(),
        headers_strategy(),
        body_strategy(),
    )
        .prop_map(|(status, reason, mut headers, (body, framing))| {
            headers.push(framing.name, framing.value);
            HttpResponse {
                version: Version::Http11,
                status,
                reason,
                headers,
                body,
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn request_roundtrip(request in request_strategy()) {
        let bytes = encode_request(&request, false);
        let parsed = parse_request_back(&bytes);
        prop_assert_eq!(parsed, request);
    }

    #[test]
    fn response_roundtrip(response in response_strategy()) {
        let bytes = encode_response(&response);
        let parsed = parse_response_back(&bytes);
        prop_assert_eq!(parsed, response);
    }

    /// A close-delimited response (no framing headers) also survives the
    /// roundtrip; the body simply runs to end of stream.
    #[test]
    fn close_delimited_response_roundtrip(
        status in (200u16..=599).prop_filter("status with a body", |s| *s != 204 && *s != 304),
        headers in headers_strategy(),
        body in prop::collection::vec(any::<u8>(), 1..200),
    ) {
        let response = HttpResponse {
            version: Version::Http11,
            status,
            reason: "OK".to_string(),
            headers,
            body: Bytes::from(body),
        };
        let bytes = encode_response(&response);
        let parsed = parse_response_back(&bytes);
        prop_assert_eq!(parsed, response);
    }

    /// URL display/parse agree for absolute-form targets.
    #[test]
    fn url_roundtrip(url in url_strategy()) {
        let rendered = url.to_string();
        let parsed = Url::parse(&rendered).unwrap();
        prop_assert_eq!(parsed, url);
    }
}
