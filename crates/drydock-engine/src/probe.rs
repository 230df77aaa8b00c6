//! Health probe primitives.
//!
//! A probe never blocks past its timeout: a hung endpoint must not stall
//! the healer's cycle or a deploy's health gate.

use std::time::Duration;

use tracing::debug;

/// Result of one HTTP probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProbe {
    /// The endpoint answered with this status code.
    Status(u16),
    /// Connection, handshake, or timeout failure.
    Failed,
}

/// Probe `http://{address}{path}` with a bounded timeout.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> HttpProbe {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return HttpProbe::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return HttpProbe::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "drydock-engine/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(_) => return HttpProbe::Failed,
        };

        match sender.send_request(req).await {
            Ok(resp) => HttpProbe::Status(resp.status().as_u16()),
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                HttpProbe::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "probe timed out");
            HttpProbe::Failed
        }
    }
}

/// Bare TCP connect check for apps that don't speak HTTP.
pub async fn tcp_probe(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
