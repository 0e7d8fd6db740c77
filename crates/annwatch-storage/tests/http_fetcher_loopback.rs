use std::sync::{Arc, Mutex};
use std::time::Duration;

use annwatch_storage::{Fetch, FetchError, FetchRequest, HttpClientConfig, HttpFetcher, RetryPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn reply(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} X\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn serve(replies: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
    serve_raw(replies.into_iter().map(|(status, body)| reply(status, body)).collect()).await
}

/// Writes the raw responses in order, one per connection, and records each request head.
async fn serve_raw(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            log.lock().unwrap().push(String::from_utf8_lossy(&buf).to_string());

            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}/api"), seen)
}

fn fetcher(max_attempts: usize) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("Mozilla/5.0".to_string()),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
    })
    .expect("client")
}

#[tokio::test(flavor = "multi_thread")]
async fn server_error_is_retried_then_body_returned() {
    let (url, seen) = serve(vec![(503, "busy"), (200, r#"{"Table":[]}"#)]).await;
    let request = FetchRequest::get(&url)
        .query("strSearch", "P")
        .query("strPrevDate", "20260208")
        .header("Referer", "https://www.bseindia.com/");

    let resp = fetcher(5).fetch("announcement-api", &request).await.expect("fetch");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), r#"{"Table":[]}"#);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let head = seen[1].to_lowercase();
    assert!(head.starts_with("get /api?strsearch=p&strprevdate=20260208 "));
    assert!(head.contains("referer: https://www.bseindia.com/"));
    assert!(head.contains("user-agent: mozilla/5.0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn client_error_is_returned_after_one_attempt() {
    let (url, seen) = serve(vec![(404, "missing"), (200, "unreachable")]).await;

    let err = fetcher(5)
        .fetch("announcement-html", &FetchRequest::get(&url))
        .await
        .expect_err("404 must fail");
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn body_cut_short_is_retried() {
    let truncated = "HTTP/1.1 200 OK\r\ncontent-length: 100\r\nconnection: close\r\n\r\n{\"Tab".to_string();
    let (url, seen) = serve_raw(vec![truncated, reply(200, r#"{"Table":[]}"#)]).await;

    let resp = fetcher(3)
        .fetch("announcement-api", &FetchRequest::get(&url))
        .await
        .expect("second attempt succeeds");
    assert_eq!(resp.text(), r#"{"Table":[]}"#);
    assert_eq!(seen.lock().unwrap().len(), 2);
}
