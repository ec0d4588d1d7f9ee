//! Helpers shared by the HTTP client tests

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Raw requests received by a scripted server, in arrival order
pub type RequestLog = Arc<Mutex<Vec<String>>>;

/// Serve `responses` in order, one connection each, then stop listening.
pub async fn spawn_scripted_server(responses: Vec<(&'static str, String)>) -> String {
    spawn_recording_server(responses).await.0
}

/// Like [`spawn_scripted_server`], also recording every request.
pub async fn spawn_recording_server(
    responses: Vec<(&'static str, String)>,
) -> (String, RequestLog) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let address = listener.local_addr().expect("local address");
    let log = RequestLog::default();
    let recorded = log.clone();

    tokio::spawn(async move {
        for (status_line, body) in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut socket).await;
            recorded.lock().expect("request log").push(request);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{address}"), log)
}

/// Answer every connection with the same response, recording each request.
pub async fn spawn_repeating_server(
    status_line: &'static str,
    body: String,
) -> (String, RequestLog) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let address = listener.local_addr().expect("local address");
    let log = RequestLog::default();
    let recorded = log.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let request = read_request(&mut socket).await;
            recorded.lock().expect("request log").push(request);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{address}"), log)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let Ok(read) = socket.read(&mut chunk).await else {
            break;
        };
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let text = String::from_utf8_lossy(&buffer);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buffer.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// In-memory database and store wired to a connectivity monitor that
/// re-probes on every call.
pub struct SyncFixture {
    pub db: crate::services::DatabaseService,
    pub store: Arc<super::MemoryDocumentStore>,
    pub connectivity: Arc<super::ConnectivityMonitor>,
}

impl SyncFixture {
    pub async fn new() -> Self {
        Self::with_cache_ttl(std::time::Duration::ZERO).await
    }

    pub async fn with_cache_ttl(cache_ttl: std::time::Duration) -> Self {
        let db = crate::services::DatabaseService::open_in_memory()
            .await
            .expect("open in-memory database");
        let store = Arc::new(super::MemoryDocumentStore::new());
        let connectivity = Arc::new(super::ConnectivityMonitor::new(
            store.clone(),
            "users",
            cache_ttl,
            std::time::Duration::from_secs(1),
        ));
        Self {
            db,
            store,
            connectivity,
        }
    }

    pub fn pusher(&self) -> super::PushSyncer {
        super::PushSyncer::new(
            self.db.clone(),
            self.store.clone(),
            self.connectivity.clone(),
            std::time::Duration::from_secs(1),
        )
    }

    pub async fn user(&self, email: &str) -> crate::models::User {
        self.db
            .create_user(
                crate::services::NewUser {
                    email: email.to_string(),
                    password_hash: Some("$argon2id$hash".to_string()),
                    full_name: Some("Test User".to_string()),
                    ..Default::default()
                },
                crate::util::now_millis(),
            )
            .await
            .expect("create user")
    }
}
