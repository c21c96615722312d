// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use http::Method;
use matrix_sdk_core::{
    error::TransportError, Canceller, EncryptedFileInfo, Error, MatrixErrorCode, MediaStream,
    Net, Pusher, PusherKind,
};
use serde_json::json;
use sha2::Digest;
use tokio::io::AsyncReadExt;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, Request, ResponseTemplate,
};

async fn connected_net() -> (MockServer, Net) {
    let server = MockServer::start().await;
    let net = Net::new();
    net.set_homeserver(&server.uri()).unwrap();
    (server, net)
}

#[tokio::test]
async fn send_json_round_trip_with_access_token() {
    let (server, net) = connected_net().await;
    net.set_access_token(Some("syt_secret"));

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("access_token", "syt_secret"))
        .and(query_param("since", "s72594_4483"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_batch": "s1"})))
        .expect(1)
        .mount(&server)
        .await;

    let query = vec![("since".to_owned(), "s72594_4483".to_owned())];
    let response = net
        .send_json(0, None, "/_matrix/client/r0/sync", Method::GET, Some(query.as_slice()), None)
        .await
        .unwrap();

    assert_eq!(response["next_batch"], "s1");
}

#[tokio::test]
async fn limit_exceeded_surfaces_the_retry_hint() {
    let (server, net) = connected_net().await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/join"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "errcode": "M_LIMIT_EXCEEDED",
            "error": "slow",
            "retry_after_ms": 1234,
        })))
        .mount(&server)
        .await;

    let error = net
        .send_json(0, Some(json!({})), "/_matrix/client/r0/join", Method::POST, None, None)
        .await
        .unwrap_err();

    assert_matches!(
        error,
        Error::Matrix {
            code: MatrixErrorCode::LimitExceeded,
            retry_after_ms: Some(1234),
            ..
        }
    );
}

#[tokio::test]
async fn non_json_failure_is_a_transport_error() {
    let (server, net) = connected_net().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/whoami"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let error = net
        .send_json(0, None, "/_matrix/client/r0/whoami", Method::GET, None, None)
        .await
        .unwrap_err();

    assert_matches!(error, Error::Transport(TransportError::Status(status)) if status == 502);
}

#[tokio::test]
async fn scalar_response_roots_are_invalid() {
    let (server, net) = connected_net().await;

    Mock::given(method("GET"))
        .and(path("/scalar"))
        .respond_with(ResponseTemplate::new(200).set_body_string("42"))
        .mount(&server)
        .await;

    let error = net.send_json(0, None, "/scalar", Method::GET, None, None).await.unwrap_err();
    assert_matches!(error, Error::InvalidData(_));
}

/// Records the order requests reach the server.
struct RecordPath(Arc<Mutex<Vec<String>>>);

impl wiremock::Match for RecordPath {
    fn matches(&self, request: &Request) -> bool {
        self.0.lock().unwrap().push(request.url.path().to_owned());
        true
    }
}

#[tokio::test]
async fn queued_requests_dispatch_by_priority() {
    let (server, net) = connected_net().await;
    let net = Arc::new(net);

    // Four slow responses saturate the connection permits, with staggered
    // delays so queued requests are granted one at a time.
    for i in 0..4u64 {
        Mock::given(method("GET"))
            .and(path(format!("/slow/{i}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_millis(400 + 150 * i)),
            )
            .mount(&server)
            .await;
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    Mock::given(RecordPath(order.clone()))
        .and(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let net = net.clone();
        handles.push(tokio::spawn(async move {
            net.send_json(0, None, &format!("/slow/{i}"), Method::GET, None, None).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The very-low priority request is queued first...
    {
        let net = net.clone();
        handles.push(tokio::spawn(async move {
            net.send_json(-3, None, "/probe/low", Method::GET, None, None).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // ...but the normal priority one queued later goes out first.
    {
        let net = net.clone();
        handles.push(tokio::spawn(async move {
            net.send_json(0, None, "/probe/normal", Method::GET, None, None).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let order = order.lock().unwrap();
    let normal = order.iter().position(|p| p == "/probe/normal").unwrap();
    let low = order.iter().position(|p| p == "/probe/low").unwrap();
    assert!(normal < low, "normal priority dispatched after very-low: {order:?}");
}

#[tokio::test]
async fn cancelled_requests_fail_with_cancelled() {
    let (server, net) = connected_net().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({})).set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let canceller = Canceller::new();
    let request = net.send_json(0, None, "/slow", Method::GET, None, Some(&canceller));

    let cancel = canceller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    assert_matches!(request.await, Err(Error::Cancelled));
}

#[tokio::test]
async fn requests_need_a_homeserver() {
    let net = Net::new();

    let error =
        net.send_json(0, None, "/_matrix/client/versions", Method::GET, None, None).await;
    assert_matches!(error, Err(Error::InvalidData(_)));

    let error = net.get_file("mxc://example.org/AbCd", None, None).await;
    assert_matches!(error, Err(Error::InvalidData(_)));
}

#[tokio::test]
async fn get_file_rewrites_mxc_and_decrypts() {
    let (server, net) = connected_net().await;

    // Produce ciphertext and its descriptor with the streaming cipher.
    let plaintext = b"attachment payload".to_vec();
    let mut encryptor = MediaStream::encrypting(std::io::Cursor::new(plaintext.clone()));
    let mut ciphertext = Vec::new();
    encryptor.read_to_end(&mut ciphertext).await.unwrap();
    let descriptor = encryptor.file_json("mxc://example.org/AbCd").unwrap();
    let info = EncryptedFileInfo::from_file_json(&descriptor).unwrap();

    Mock::given(method("GET"))
        .and(path("/_matrix/media/r0/download/example.org/AbCd"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ciphertext.clone()))
        .expect(2)
        .mount(&server)
        .await;

    // Plain download returns the ciphertext untouched.
    let mut stream = net.get_file("mxc://example.org/AbCd", None, None).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    assert_eq!(raw, ciphertext);

    // With key material the stream decrypts transparently.
    let mut stream = net.get_file("mxc://example.org/AbCd", Some(&info), None).await.unwrap();
    let mut decrypted = Vec::new();
    stream.read_to_end(&mut decrypted).await.unwrap();
    assert_eq!(decrypted, plaintext);
    assert_eq!(stream.sha256().unwrap(), info.sha256);
}

#[tokio::test]
async fn get_file_maps_matrix_errors() {
    let (server, net) = connected_net().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/media/r0/download/example.org/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errcode": "M_NOT_FOUND",
            "error": "Content not found",
        })))
        .mount(&server)
        .await;

    let error = net.get_file("mxc://example.org/gone", None, None).await.unwrap_err();
    assert_matches!(error, Error::Matrix { code: MatrixErrorCode::NotFound, .. });
}

#[tokio::test]
async fn put_file_uploads_and_returns_the_content_uri() {
    let (server, net) = connected_net().await;
    net.set_access_token(Some("syt_secret"));

    Mock::given(method("POST"))
        .and(path("/_matrix/media/r0/upload"))
        .and(query_param("access_token", "syt_secret"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"content_uri": "mxc://h.example/XYZ"})),
        )
        .mount(&server)
        .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"abc").unwrap();

    let progress: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress.clone();

    let upload = net
        .put_file(
            file.path(),
            Some(mime::TEXT_PLAIN),
            false,
            Some(Box::new(move |sent, total| {
                progress_sink.lock().unwrap().push((sent, total));
            })),
            None,
        )
        .await
        .unwrap();

    assert_eq!(upload.content_uri, "mxc://h.example/XYZ");
    assert!(upload.encrypted_file.is_none());
    assert_eq!(progress.lock().unwrap().last(), Some(&(3, 3)));

    let requests = server.received_requests().await.unwrap();
    let upload_request = requests
        .iter()
        .find(|r| r.url.path() == "/_matrix/media/r0/upload")
        .unwrap();
    assert_eq!(upload_request.body, b"abc");
    assert_eq!(
        upload_request.headers.get("content-type").unwrap().to_str().unwrap(),
        "text/plain"
    );
}

#[tokio::test]
async fn encrypted_put_file_ships_opaque_bytes_and_a_descriptor() {
    let (server, net) = connected_net().await;

    Mock::given(method("POST"))
        .and(path("/_matrix/media/r0/upload"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"content_uri": "mxc://h.example/enc"})),
        )
        .mount(&server)
        .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"abc").unwrap();

    let upload = net
        .put_file(file.path(), Some(mime::TEXT_PLAIN), true, None, None)
        .await
        .unwrap();

    assert_eq!(upload.content_uri, "mxc://h.example/enc");
    let descriptor = upload.encrypted_file.unwrap();
    assert_eq!(descriptor["v"], "v2");
    assert_eq!(descriptor["url"], "mxc://h.example/enc");

    let requests = server.received_requests().await.unwrap();
    let upload_request = requests
        .iter()
        .find(|r| r.url.path() == "/_matrix/media/r0/upload")
        .unwrap();

    // The body went out encrypted, announced as opaque bytes, and the
    // descriptor's digest covers exactly those bytes.
    assert_eq!(upload_request.body.len(), 3);
    assert_ne!(upload_request.body, b"abc");
    assert_eq!(
        upload_request.headers.get("content-type").unwrap().to_str().unwrap(),
        "application/octet-stream"
    );

    let digest = sha2::Sha256::digest(&upload_request.body);
    let expected = base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, digest);
    assert_eq!(descriptor["hashes"]["sha256"].as_str().unwrap(), expected);
}

#[tokio::test]
async fn pusher_gateway_validation() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"unifiedpush": {"gateway": "matrix"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apn"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"unifiedpush": {"gateway": "apn"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let mut pusher = Pusher::new();
    pusher.kind = PusherKind::Http;

    pusher.url = Some(format!("{}/good", server.uri()));
    pusher.check_valid(None).await.unwrap();

    pusher.url = Some(format!("{}/apn", server.uri()));
    assert_matches!(pusher.check_valid(None).await, Err(Error::BadPushGateway(_)));

    pusher.url = Some(format!("{}/html", server.uri()));
    assert_matches!(pusher.check_valid(None).await, Err(Error::BadPushGateway(_)));
}

#[tokio::test]
async fn homeserver_version_probe() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/versions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"versions": ["r0.6.1", "v1.5"]})),
        )
        .mount(&server)
        .await;

    assert!(matrix_sdk_core::utils::verify_homeserver(&server.uri(), 5, None).await.unwrap());
    assert_matches!(
        matrix_sdk_core::utils::verify_homeserver("ftp://example.org", 5, None).await,
        Err(Error::InvalidData(_))
    );

    let ancient = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"versions": ["r0.1.0"]})))
        .mount(&ancient)
        .await;

    assert!(!matrix_sdk_core::utils::verify_homeserver(&ancient.uri(), 5, None).await.unwrap());
}
