use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use portfolio_cms::config::Tables;
use portfolio_cms::content::ContentService;
use portfolio_cms::store::{ContentStore, PostgrestClient, Query, StoreError};

const TABLE: &str = "projects_ap2024";

fn reply(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Reads one request and returns its request line.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    head.lines().next().unwrap_or_default().to_string()
}

/// Serves `responses` in order, one connection each, and records request lines.
async fn serve(responses: Vec<String>) -> (PostgrestClient, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let line = read_request(&mut stream).await;
            log.lock().await.push(line);
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        }
    });
    let base = Url::parse(&format!("http://{addr}")).unwrap();
    (PostgrestClient::new(base, "anon-key".into()), seen)
}

#[tokio::test]
async fn update_of_unknown_id_is_not_found() {
    let (client, seen) = serve(vec![reply("200 OK", "[]")]).await;

    let err = client
        .update(TABLE, "missing", json!({"title": "changed"}))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound { ref id, .. } if id == "missing"));
    let seen = seen.lock().await;
    assert!(seen[0].starts_with("PATCH /rest/v1/projects_ap2024?id=eq.missing"));
}

#[tokio::test]
async fn delete_of_unknown_id_is_not_found() {
    let (client, seen) = serve(vec![reply("200 OK", "[]")]).await;

    let err = client.delete(TABLE, "missing").await.unwrap_err();

    assert!(matches!(err, StoreError::NotFound { ref table, .. } if table == TABLE));
    assert!(seen.lock().await[0].starts_with("DELETE /rest/v1/projects_ap2024?id=eq.missing"));
}

#[tokio::test]
async fn delete_with_returned_row_succeeds() {
    let (client, _) = serve(vec![reply("200 OK", r#"[{"id":"p1"}]"#)]).await;

    client.delete(TABLE, "p1").await.unwrap();
}

#[tokio::test]
async fn error_body_becomes_api_error() {
    let body = r#"{"code":"23502","message":"null value in column \"title\"","details":null,"hint":null}"#;
    let (client, _) = serve(vec![reply("400 Bad Request", body)]).await;

    let err = client.insert(TABLE, json!({})).await.unwrap_err();

    match err {
        StoreError::Api {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 400);
            assert_eq!(code.as_deref(), Some("23502"));
            assert!(message.contains("title"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn insert_without_returned_row_is_invalid() {
    let (client, _) = serve(vec![reply("201 Created", "[]")]).await;

    let err = client.insert(TABLE, json!({"title": "P1"})).await.unwrap_err();

    assert!(matches!(err, StoreError::Invalid(_)));
}

#[tokio::test]
async fn truncated_success_body_is_an_error() {
    let truncated = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 500\r\nConnection: close\r\n\r\n[{\"id\":1".to_string();
    let (client, _) = serve(vec![truncated.clone(), truncated]).await;

    let err = client.select(TABLE, &Query::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Http(_)));

    let content = ContentService::new(Arc::new(client), Tables::default());
    assert!(content.projects().list().await.is_err());
}

#[tokio::test]
async fn listed_rows_decode_through_content_layer() {
    let rows = r#"[{"id":7,"created_at":"2024-05-01T10:00:00+00:00","title":"P1","featured":true}]"#;
    let (client, seen) = serve(vec![reply("200 OK", rows)]).await;
    let content = ContentService::new(Arc::new(client), Tables::default());

    let featured = content.projects().featured().await.unwrap();

    assert_eq!(featured.len(), 1);
    assert_eq!(featured[0].id, "7");
    assert_eq!(featured[0].title, "P1");
    let line = seen.lock().await[0].clone();
    assert!(line.starts_with("GET /rest/v1/projects_ap2024?select=*"));
    assert!(line.contains("featured=eq.true"));
    assert!(line.contains("limit=4"));
}

#[tokio::test]
async fn empty_rpc_reply_is_null() {
    let (client, seen) = serve(vec![reply("204 No Content", "")]).await;

    let value = client
        .rpc("increment_views", json!({"table_name": TABLE, "record_id": "7"}))
        .await
        .unwrap();

    assert_eq!(value, Value::Null);
    assert!(seen.lock().await[0].starts_with("POST /rest/v1/rpc/increment_views"));
}
