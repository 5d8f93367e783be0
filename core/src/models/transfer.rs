//! One resumable HTTP transfer into a `.partial` file.

use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use log::{debug, info};
use reqwest::header::{ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::fetcher::FetchError;

/// Why a transfer stopped at the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Timeout,
    ConnectionLost,
    HostUnreachable,
    DnsFailure,
    NotConnected,
    ResourceUnavailable,
    Other,
}

impl TransportKind {
    pub fn is_retryable(self) -> bool {
        self != TransportKind::Other
    }

    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportKind::Timeout;
        }
        let io_kind = io_error_kind(err);

        if err.is_connect() {
            return match io_kind {
                Some(io::ErrorKind::TimedOut) => TransportKind::Timeout,
                Some(io::ErrorKind::ConnectionRefused)
                | Some(io::ErrorKind::NotConnected)
                | Some(io::ErrorKind::AddrNotAvailable) => TransportKind::NotConnected,
                _ if mentions(err, &["dns", "lookup", "resolve", "name or service"]) => {
                    TransportKind::DnsFailure
                }
                _ if mentions(err, &["unreachable"]) => TransportKind::HostUnreachable,
                _ => TransportKind::NotConnected,
            };
        }

        if err.is_body() || err.is_decode() || err.is_request() {
            return match io_kind {
                Some(io::ErrorKind::TimedOut) => TransportKind::Timeout,
                _ => TransportKind::ConnectionLost,
            };
        }

        TransportKind::Other
    }
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

fn mentions(err: &(dyn StdError + 'static), needles: &[&str]) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if needles.iter().any(|n| text.contains(n)) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Where an interrupted transfer can pick up again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub partial_path: PathBuf,
    pub offset: u64,
    /// `ETag` or `Last-Modified` of the response the bytes came from
    pub validator: Option<String>,
}

impl ResumeToken {
    /// The token is only honoured if the partial file still holds exactly
    /// the bytes it describes.
    async fn still_valid_for(&self, partial: &Path) -> bool {
        if self.offset == 0 || self.partial_path != partial {
            return false;
        }
        matches!(tokio::fs::metadata(partial).await, Ok(meta) if meta.len() == self.offset)
    }
}

#[derive(Debug)]
pub struct TransferFailure {
    pub error: FetchError,
    /// Token to cache for the next attempt, if any bytes are reusable
    pub resume: Option<ResumeToken>,
}

impl TransferFailure {
    fn new(error: FetchError, resume: Option<ResumeToken>) -> Self {
        Self { error, resume }
    }
}

/// Stream `url` into `partial`, resuming from `resume` when it still applies.
///
/// A `206` reply is appended to the existing bytes; any other success
/// status restarts the file from zero. `on_progress` receives the bytes on
/// disk and the total when the server reports a length.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    partial: &Path,
    resume: Option<ResumeToken>,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64, Option<u64>) + Send,
) -> Result<u64, TransferFailure> {
    let resume = match resume {
        Some(token) if token.still_valid_for(partial).await => Some(token),
        Some(_) => {
            debug!("Discarding stale resume token for {:?}", partial);
            None
        }
        None => None,
    };
    let offset = resume.as_ref().map_or(0, |t| t.offset);

    let mut request = client.get(url);
    if let Some(token) = &resume {
        info!("Resuming {} from {} bytes", url, token.offset);
        request = request.header(RANGE, format!("bytes={}-", token.offset));
        if let Some(validator) = &token.validator {
            request = request.header(IF_RANGE, validator.as_str());
        }
    }

    let sent = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(TransferFailure::new(FetchError::Cancelled, resume.clone()));
        }
        sent = request.send() => sent,
    };
    let response = sent.map_err(|e| TransferFailure::new(FetchError::transport(&e), resume.clone()))?;

    let status = response.status();
    if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
        let _ = tokio::fs::remove_file(partial).await;
        return Err(TransferFailure::new(
            FetchError::Transport {
                kind: TransportKind::ResourceUnavailable,
                detail: format!("server rejected resume offset {}", offset),
            },
            None,
        ));
    }
    if !status.is_success() {
        let error = match status {
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS => FetchError::Transport {
                kind: TransportKind::ResourceUnavailable,
                detail: format!("server returned {}", status),
            },
            _ => FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            },
        };
        return Err(TransferFailure::new(error, resume));
    }

    let appending = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    if offset > 0 && !appending {
        info!("Server ignored range request for {}, restarting", url);
    }
    let start = if appending { offset } else { 0 };
    let total = response.content_length().map(|len| len + start);
    let validator = response
        .headers()
        .get(ETAG)
        .or_else(|| response.headers().get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let token_at = |written: u64| {
        (written > 0).then(|| ResumeToken {
            partial_path: partial.to_path_buf(),
            offset: written,
            validator: validator.clone(),
        })
    };

    let opened = if appending {
        tokio::fs::OpenOptions::new().append(true).open(partial).await
    } else {
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(partial)
            .await
    };
    let file = opened.map_err(|e| TransferFailure::new(FetchError::Io(e), None))?;

    let mut file = tokio::io::BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written = start;
    on_progress(written, total);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = file.flush().await;
                return Err(TransferFailure::new(FetchError::Cancelled, token_at(written)));
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            None => break,
            Some(Ok(bytes)) => {
                if let Err(e) = file.write_all(&bytes).await {
                    let _ = file.flush().await;
                    return Err(TransferFailure::new(FetchError::Io(e), None));
                }
                written += bytes.len() as u64;
                on_progress(written, total);
            }
            Some(Err(e)) => {
                let _ = file.flush().await;
                return Err(TransferFailure::new(FetchError::transport(&e), token_at(written)));
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| TransferFailure::new(FetchError::Io(e), None))?;

    if let Some(total) = total {
        if written < total {
            return Err(TransferFailure::new(
                FetchError::Transport {
                    kind: TransportKind::ConnectionLost,
                    detail: format!("connection closed after {} of {} bytes", written, total),
                },
                token_at(written),
            ));
        }
    }

    debug!("Transferred {} bytes into {:?}", written, partial);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_token_requires_matching_partial_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let partial = dir.path().join("model.onnx.partial");
        tokio::fs::write(&partial, vec![1u8; 10]).await.expect("write");

        let token = |path: &Path, offset| ResumeToken {
            partial_path: path.to_path_buf(),
            offset,
            validator: None,
        };

        assert!(token(&partial, 10).still_valid_for(&partial).await);
        assert!(!token(&partial, 9).still_valid_for(&partial).await);
        assert!(!token(&partial, 0).still_valid_for(&partial).await);
        assert!(
            !token(&dir.path().join("other.partial"), 10)
                .still_valid_for(&partial)
                .await
        );
    }

    #[tokio::test]
    async fn refused_connection_is_not_connected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = reqwest::Client::new()
            .get(format!("http://{}/model.onnx", addr))
            .send()
            .await
            .expect_err("nothing is listening");

        let kind = TransportKind::classify(&err);
        assert_eq!(kind, TransportKind::NotConnected);
        assert!(kind.is_retryable());
    }

    #[test]
    fn only_other_is_terminal() {
        assert!(TransportKind::Timeout.is_retryable());
        assert!(TransportKind::ResourceUnavailable.is_retryable());
        assert!(!TransportKind::Other.is_retryable());
        assert_eq!(TransportKind::DnsFailure.to_string(), "dns_failure");
    }
}
