//! Tarball upload and download streams
//!
//! Both directions run the transfer on a spawned task and talk to the caller
//! through a bounded channel, so a slow side holds the other back instead of
//! buffering whole tarballs in memory. These functions must be called from
//! within a Tokio runtime.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Body, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::{Missing, UplinkError};
use crate::request::{AbortFlag, RequestExecutor, ResponseEncoding, Target, UplinkRequest};
use crate::uplink::Uplink;

/// Chunks buffered between the caller and the transfer task
const CHANNEL_CAPACITY: usize = 16;

/// Read size used by [`TarballUpload::copy_from`]
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How an upload ended
#[derive(Debug)]
pub enum Settled {
    /// The uplink accepted the tarball
    Success,
    /// The uplink refused it, or the transfer failed
    Failed(UplinkError),
    /// The caller aborted the upload
    Aborted,
}

impl Settled {
    pub fn is_success(&self) -> bool {
        matches!(self, Settled::Success)
    }
}

/// Write side of a tarball upload
///
/// Bytes written here are forwarded to the uplink as they arrive. Call
/// [`finish`](Self::finish) to end the body and wait for the uplink's answer,
/// or [`abort`](Self::abort) to cancel. Dropping an unfinished upload aborts it.
pub struct TarballUpload {
    sender: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    task: Option<JoinHandle<Settled>>,
    aborted: AbortFlag,
}

impl TarballUpload {
    /// Forward one chunk, waiting while the transfer is behind
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), UplinkError> {
        let sender = self.sender.as_ref().ok_or(UplinkError::StreamClosed)?;
        sender
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| UplinkError::StreamClosed)
    }

    /// Forward everything `reader` yields, returning the byte count
    pub async fn copy_from<R>(&mut self, mut reader: R) -> Result<u64, UplinkError>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
    }

    /// End the body and wait for the terminal signal
    pub async fn finish(mut self) -> Settled {
        drop(self.sender.take());

        let Some(task) = self.task.take() else {
            return Settled::Aborted;
        };

        let settled = match task.await {
            Ok(settled) => settled,
            Err(err) if err.is_cancelled() => Settled::Aborted,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        };

        if self.aborted.is_set() {
            Settled::Aborted
        } else {
            settled
        }
    }

    /// Cancel the upload
    ///
    /// The transfer task is cancelled at its next scheduling point. From now
    /// on the transfer no longer affects uplink health and the upload settles
    /// as [`Settled::Aborted`]. Calling this more than once has no effect.
    pub fn abort(&self) {
        if self.aborted.set() {
            debug!("Aborting tarball upload");
            if let Some(task) = &self.task {
                task.abort();
            }
        }
    }

    /// Completion hook for callers that need one; does nothing
    pub fn done(&self) {}

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }
}

impl Drop for TarballUpload {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.abort();
        }
    }
}

/// Read side of a tarball download
///
/// Yields the tarball in chunks. A failed download yields exactly one `Err`
/// and then ends; a successful one simply ends after its last chunk.
pub struct TarballDownload {
    receiver: mpsc::Receiver<Result<Bytes, UplinkError>>,
}

impl TarballDownload {
    /// Downloads are abandoned by dropping the stream; this does nothing
    pub fn abort(&self) {}

    /// Read the whole tarball into memory
    pub async fn bytes(mut self) -> Result<Bytes, UplinkError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl Stream for TarballDownload {
    type Item = Result<Bytes, UplinkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Uplink {
    /// Start uploading a tarball for `name`
    pub fn publish_tarball(&self, name: &str, filename: &str) -> TarballUpload {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let body = Body::wrap_stream(ReceiverStream::new(receiver).inspect(
            move |chunk: &Result<Bytes, std::io::Error>| {
                if let Ok(chunk) = chunk {
                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
            },
        ));

        let request = UplinkRequest::put(Target::path([name, "-", filename, "whatever"]))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(body);

        let aborted = AbortFlag::new();
        let task = tokio::spawn(upload(
            self.executor.clone(),
            request,
            aborted.clone(),
            sent,
        ));

        TarballUpload {
            sender: Some(sender),
            task: Some(task),
            aborted,
        }
    }

    /// Download `filename` of package `name` from this uplink
    pub fn fetch_tarball(&self, name: &str, filename: &str) -> TarballDownload {
        self.download(Target::path([name, "-", filename]))
    }

    /// Download a tarball from an absolute URL
    ///
    /// Use [`Uplink::can_fetch`] first to check that `url` belongs to this
    /// uplink when it was taken from package metadata.
    pub fn fetch_url(&self, url: &str) -> TarballDownload {
        self.download(Target::Absolute(url.to_string()))
    }

    fn download(&self, target: Target) -> TarballDownload {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

        let request = UplinkRequest::get(target)
            .header(
                ACCEPT,
                HeaderValue::from_static("application/octet-stream"),
            )
            .encoding(ResponseEncoding::Binary);

        tokio::spawn(download(self.executor.clone(), request, sender));

        TarballDownload { receiver }
    }
}

async fn upload(
    executor: RequestExecutor,
    request: UplinkRequest,
    aborted: AbortFlag,
    sent: Arc<AtomicU64>,
) -> Settled {
    let (mut attempt, response) = match executor.send(request, &aborted).await {
        Ok(sent) => sent,
        Err(_) if aborted.is_set() => return Settled::Aborted,
        Err(err) => return Settled::Failed(err),
    };
    if aborted.is_set() {
        return Settled::Aborted;
    }

    let status = response.status();
    let bytes_out = response.bytes().await.map(|b| b.len() as u64).unwrap_or(0);
    attempt.bytes_in = sent.load(Ordering::Relaxed);

    if !status.is_success() {
        let err = UplinkError::BadUplinkStatus {
            status: status.as_u16(),
        };
        attempt.log(Some(status), bytes_out, Some(&err.to_string()));
        return Settled::Failed(err);
    }

    attempt.log(Some(status), bytes_out, None);
    Settled::Success
}

async fn download(
    executor: RequestExecutor,
    request: UplinkRequest,
    sender: mpsc::Sender<Result<Bytes, UplinkError>>,
) {
    let (attempt, mut response) = match executor.send(request, &AbortFlag::new()).await {
        Ok(sent) => sent,
        Err(err) => {
            let _ = sender.send(Err(err)).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let err = if status == StatusCode::NOT_FOUND {
            UplinkError::NotFound(Missing::File)
        } else {
            UplinkError::BadUplinkStatus {
                status: status.as_u16(),
            }
        };
        attempt.log(Some(status), 0, Some(&err.to_string()));
        let _ = sender.send(Err(err)).await;
        return;
    }

    let mut received = 0u64;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                received += chunk.len() as u64;
                if sender.send(Ok(chunk)).await.is_err() {
                    debug!("Tarball download from {} abandoned by reader", attempt.url);
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                executor.health().report_outcome(false);
                attempt.log(Some(status), received, Some(&err.to_string()));
                let _ = sender.send(Err(UplinkError::Transport(err))).await;
                return;
            }
        }
    }

    attempt.log(Some(status), received, None);
}
