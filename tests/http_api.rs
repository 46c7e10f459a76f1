mod common;

use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode},
};
use common::{BUCKET, Harness, STORE_ORIGIN};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Follow an object-store link the way a client would.
async fn follow(app: &Router, method: Method, link: &str, body: &[u8]) -> (StatusCode, HeaderMap, Bytes) {
    let uri = link.strip_prefix(STORE_ORIGIN).unwrap();
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_vec()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes)
}

fn encode(file_id: &str) -> String {
    file_id.replace('/', "%2F")
}

#[tokio::test]
async fn health_endpoints_answer() {
    let h = Harness::new().await;
    let app = h.app();

    let (status, body) = call(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["object_store"]["ok"], true);
}

#[tokio::test]
async fn upload_round_trip_over_http() {
    let h = Harness::new().await;
    let app = h.app();
    let (project, node) = h.project(1).await;
    let file_id = format!("{project}/{node}/report.pdf");

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/v0/locations/0/files/{}?user_id=1&file_size=5", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["urls"].as_array().unwrap().len(), 1);
    let complete = body["data"]["links"]["complete_upload"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(complete.contains(":complete?user_id=1"));

    h.store.put_object(BUCKET, &file_id, &b"%PDF-"[..]).await.unwrap();
    let (status, body) = call(&app, Method::POST, &complete, Some(json!({"parts": []}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["file_id"], file_id);
    assert_eq!(body["data"]["file_size"], 5);

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/v0/locations/0/files/{}/metadata?user_id=1", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["file_size"], 5);

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/v0/locations/0/files/{}?user_id=1", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["link"].as_str().unwrap().starts_with("http://s3.local/"));

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/v0/locations/0/files/{}?user_id=2", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/v0/locations/0/files/{}?user_id=1", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!h.object_exists(&file_id).await);
}

#[tokio::test]
async fn upload_and_download_links_are_served() {
    let h = Harness::new().await;
    let app = h.app();
    let (project, node) = h.project(1).await;
    let file_id = format!("{project}/{node}/a.txt");

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/v0/locations/0/files/{}?user_id=1&file_size=3", encode(&file_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let upload_url = body["data"]["urls"][0].as_str().unwrap().to_string();
    let complete = body["data"]["links"]["complete_upload"].as_str().unwrap().to_string();

    let (status, headers, _) = follow(&app, Method::PUT, &upload_url, b"abc").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("etag"));

    let (status, body) = call(&app, Method::POST, &complete, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["file_size"], 3);

    let (_, body) = call(
        &app,
        Method::GET,
        &format!("/v0/locations/0/files/{}?user_id=1", encode(&file_id)),
        None,
    )
    .await;
    let download_url = body["data"]["link"].as_str().unwrap().to_string();
    let (status, _, bytes) = follow(&app, Method::GET, &download_url, b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&bytes[..], b"abc");

    // survives a cleaner pass since the bytes arrived
    let report = h
        .cleaner()
        .clean_expired_uploads(chrono::Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert!(report.removed.is_empty());
}

#[tokio::test]
async fn multipart_parts_are_uploaded_through_their_links() {
    let h = Harness::new().await;
    let app = h.app();
    let (project, node) = h.project(1).await;
    let file_id = format!("{project}/{node}/big.bin");

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!(
            "/v0/locations/0/files/{}?user_id=1&file_size={}",
            encode(&file_id),
            300 * 1024 * 1024
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let urls: Vec<String> = body["data"]["urls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|url| url.as_str().unwrap().to_string())
        .collect();
    assert!(urls.len() > 1);
    let complete = body["data"]["links"]["complete_upload"].as_str().unwrap().to_string();

    let mut parts = Vec::new();
    for (index, (url, chunk)) in urls.iter().zip([&b"first-"[..], &b"second"[..]]).enumerate() {
        let (status, headers, _) = follow(&app, Method::PUT, url, chunk).await;
        assert_eq!(status, StatusCode::OK);
        let e_tag = headers["etag"].to_str().unwrap().to_string();
        parts.push(json!({"number": index + 1, "e_tag": e_tag}));
    }

    let (status, body) = call(&app, Method::POST, &complete, Some(json!({"parts": parts}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["file_size"], 12);
    assert_eq!(
        h.store.get_object_bytes(BUCKET, &file_id).await.unwrap(),
        &b"first-second"[..]
    );
}

#[tokio::test]
async fn missing_file_metadata_answers_an_empty_envelope() {
    let h = Harness::new().await;
    let app = h.app();
    let (project, node) = h.project(1).await;

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/v0/locations/0/files/{}/metadata?user_id=1", encode(&format!("{project}/{node}/nope"))),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {}, "error": "No result found"}));
}

#[tokio::test]
async fn errors_carry_their_status() {
    let h = Harness::new().await;
    let app = h.app();

    let (status, body) = call(&app, Method::GET, "/v0/locations/7/files/metadata?user_id=1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (status, _) = call(
        &app,
        Method::PUT,
        &format!("/v0/locations/0/files/{}?user_id=1", encode("not-a-project/file")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn locations_and_soft_copies() {
    let h = Harness::new().await;
    let app = h.app();
    let (project, node) = h.project(1).await;
    let target = format!("{project}/{node}/data.csv");
    h.upload(1, &target, b"1,2,3").await;

    let (status, body) = call(&app, Method::GET, "/v0/locations?user_id=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([{"id": 0, "name": "simcore.s3"}]));

    let link = format!("api/{}/data.csv", uuid::Uuid::new_v4());
    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/v0/files/{}:soft-copy?user_id=1", encode(&target)),
        Some(json!({"link_id": link})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["file_id"], link);
    assert_eq!(body["data"]["is_soft_link"], true);

    let (status, body) = call(
        &app,
        Method::POST,
        "/v0/simcore-s3/files/metadata:search?user_id=1&startswith=api/",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}
