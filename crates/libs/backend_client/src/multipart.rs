use crate::media::MediaKind;
use crate::metrics::{
    MEDIA_FILE_SIZE, MEDIA_TRANSFER_BYTES, MEDIA_TRANSFER_BYTES_ERROR, MEDIA_TRANSFER_COUNT,
    MEDIA_TRANSFER_ERROR, MEDIA_TRANSFER_TIME,
};
use crate::resource::{api_url, Resource};
use crate::{Backend, BackendError};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, RequestBuilder};
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// Spawns the producer half of the streaming body: a task that copies the
/// file into a bounded channel, chunk by chunk. Read errors travel down the
/// same channel and surface from the consuming stream. Cancelling `stop`
/// short-circuits the copy into end-of-input; a dropped receiver (the
/// request went away) stops the producer.
fn spawn_file_producer(
    path: PathBuf,
    mime_type: String,
    stop: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
    tokio::spawn(async move {
        let started = Instant::now();
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                MEDIA_TRANSFER_ERROR.with_label_values(&[&mime_type]).inc();
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        debug!(path = %path.display(), "multipart transfer started");
        let mut written: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                read = file.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    written += n as u64;
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    MEDIA_TRANSFER_ERROR.with_label_values(&[&mime_type]).inc();
                    MEDIA_TRANSFER_BYTES_ERROR
                        .with_label_values(&[&mime_type])
                        .inc_by(written);
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
        MEDIA_TRANSFER_TIME
            .with_label_values(&[&mime_type])
            .observe(started.elapsed().as_secs_f64());
        MEDIA_TRANSFER_COUNT.with_label_values(&[&mime_type]).inc();
        MEDIA_TRANSFER_BYTES
            .with_label_values(&[&mime_type])
            .inc_by(written);
        MEDIA_FILE_SIZE
            .with_label_values(&[&mime_type])
            .observe(written as f64);
        debug!(path = %path.display(), bytes = written, "multipart transfer finished");
    });
    rx
}

/// Streams a file into a request body without buffering it in memory.
pub(crate) fn streaming_file_body(path: PathBuf, mime_type: String, stop: CancellationToken) -> Body {
    Body::wrap_stream(ReceiverStream::new(spawn_file_producer(
        path, mime_type, stop,
    )))
}

/// Media file contents, POSTed as a multipart/form-data body with a single
/// `file` part.
pub(crate) struct FileResource {
    pub id: String,
    pub path: PathBuf,
    pub media_type: MediaKind,
    pub mime_type: String,
    pub stop: CancellationToken,
}

impl Resource for FileResource {
    fn post(&self, backend: &Backend) -> Result<RequestBuilder, BackendError> {
        let url = api_url(
            backend.api_url(),
            &["api", self.media_type.as_str(), &self.id],
        )?;
        let body = streaming_file_body(
            self.path.clone(),
            self.mime_type.clone(),
            self.stop.clone(),
        );
        let part = Part::stream(body)
            .file_name(self.path.display().to_string())
            .mime_str(&self.mime_type)?;
        let form = Form::new().part("file", part);
        // the upload client carries no overall timeout
        Ok(backend.upload_http().post(url).multipart(form))
    }

    fn put(&self, _backend: &Backend) -> Option<Result<RequestBuilder, BackendError>> {
        None
    }
}
