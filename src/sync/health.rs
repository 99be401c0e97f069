use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Liveness accounting for the convergence driver. The agent is healthy
/// until syncs fail several times in a row; a single success resets it.
pub struct SyncHealth {
    consecutive_failures: AtomicU32,
    threshold: u32,
    last_sync: Mutex<Option<Instant>>,
}

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

impl Default for SyncHealth {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl SyncHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
            last_sync: Mutex::new(None),
        }
    }

    pub fn record(&self, ok: bool) {
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_sync.lock().expect("health lock poisoned") = Some(Instant::now());
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < self.threshold
    }

    #[allow(dead_code)]
    pub fn last_sync(&self) -> Option<Instant> {
        *self.last_sync.lock().expect("health lock poisoned")
    }
}

/// Minimal liveness endpoint: 200 while healthy, 503 once the failure
/// threshold is crossed. One request per connection, no HTTP machinery.
pub async fn serve_health(health: std::sync::Arc<SyncHealth>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "health endpoint listening");

    loop {
        let (mut stream, _) = listener.accept().await?;
        let health = health.clone();
        tokio::spawn(async move {
            let response = if health.is_healthy() {
                "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nok\n"
            } else {
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 5\r\nConnection: close\r\n\r\nfail\n"
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
