//! Sequential chunked uploads.
//!
//! A payload is cut into fixed-size byte ranges which are sent one request at
//! a time in increasing offset order. Batches upload each file to completion
//! before starting the next one. Any failed chunk aborts the whole upload;
//! chunks already accepted by the device are left in place.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const KIBIBYTE: u64 = 1024;
/// Chunk size used by the file manager.
pub const FILE_CHUNK_SIZE: u64 = 1024 * KIBIBYTE;
/// Chunk size used for model uploads.
pub const MODEL_CHUNK_SIZE: u64 = 512 * KIBIBYTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Bookkeeping for one file's upload. `offset` only moves forward, by
/// exactly one span per acknowledged chunk.
#[derive(Debug, Clone)]
pub struct UploadSession {
    total_size: u64,
    offset: u64,
    chunk_size: u64,
    next_index: u64,
    trailer: Option<String>,
}

impl UploadSession {
    pub fn new(total_size: u64, chunk_size: u64, trailer: Option<String>) -> Result<Self> {
        if chunk_size == 0 {
            bail!("Chunk size must be greater than zero");
        }
        Ok(Self {
            total_size,
            offset: 0,
            chunk_size,
            next_index: 0,
            trailer,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_span(&self) -> Option<ChunkSpan> {
        if self.is_complete() {
            return None;
        }
        Some(ChunkSpan {
            index: self.next_index,
            offset: self.offset,
            len: self.chunk_size.min(self.total_size - self.offset),
        })
    }

    pub fn acknowledge(&mut self, span: ChunkSpan) {
        debug_assert_eq!(span.offset, self.offset, "chunks must be acknowledged in order");
        self.offset = span.end();
        self.next_index = span.index + 1;
    }

    /// Marks the whole payload as sent by a single request.
    pub fn finish(&mut self) {
        self.offset = self.total_size;
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.total_size
    }

    /// The metadata sidecar travels with the final chunk only.
    pub fn trailer_for(&self, span: ChunkSpan) -> Option<&str> {
        if span.end() >= self.total_size {
            self.trailer.as_deref()
        } else {
            None
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            (self.offset as f64 / self.total_size as f64).min(1.0)
        }
    }
}

pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkSpan>> {
    let mut session = UploadSession::new(total_size, chunk_size, None)?;
    let mut spans = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    while let Some(span) = session.next_span() {
        session.acknowledge(span);
        spans.push(span);
    }
    Ok(spans)
}

/// Overall batch progress as a percentage, weighting every file equally.
pub fn batch_percent(completed_files: usize, current_fraction: f64, total_files: usize) -> f64 {
    if total_files == 0 {
        return 100.0;
    }
    (((completed_files as f64 + current_fraction) / total_files as f64) * 100.0).min(100.0)
}

#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub file_name: String,
    pub data: Vec<u8>,
    pub offset: u64,
    pub total_size: u64,
    pub trailer: Option<String>,
    /// The payload is sent whole rather than as a chunk of a larger upload.
    pub single: bool,
}

/// Sends one chunk to wherever the upload is headed.
pub trait ChunkTransport: Send + Sync {
    type Response: Send;

    fn send_chunk(
        &self,
        chunk: ChunkRequest,
    ) -> impl Future<Output = Result<Self::Response>> + Send;
}

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct UploadSource {
    pub name: String,
    pub payload: Payload,
}

impl UploadSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("{} is not a file", path.display()))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            name,
            payload: Payload::File(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Bytes(bytes),
        }
    }

    async fn open(self) -> Result<(u64, ChunkReader)> {
        match self.payload {
            Payload::Bytes(bytes) => Ok((bytes.len() as u64, ChunkReader::Bytes(bytes))),
            Payload::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let size = file
                    .metadata()
                    .await
                    .context("Failed to get file metadata")?
                    .len();
                Ok((size, ChunkReader::File(file)))
            }
        }
    }
}

enum ChunkReader {
    Bytes(Vec<u8>),
    File(tokio::fs::File),
}

impl ChunkReader {
    /// Spans are read strictly in order, so the file cursor is always at `span.offset`.
    async fn read(&mut self, span: ChunkSpan) -> Result<Vec<u8>> {
        match self {
            ChunkReader::Bytes(bytes) => Ok(bytes[span.offset as usize..span.end() as usize].to_vec()),
            ChunkReader::File(file) => {
                let mut buffer = vec![0u8; span.len as usize];
                file.read_exact(&mut buffer)
                    .await
                    .context("Failed to read chunk")?;
                Ok(buffer)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    pub file_name: String,
    pub file_index: usize,
    pub file_count: usize,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

#[derive(Debug)]
pub enum UploadEvent<R> {
    Progress(UploadProgress),
    FileUploaded {
        file_name: String,
        /// Response to the last request; `None` when the file was empty.
        response: Option<R>,
    },
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    pub trailer: Option<String>,
    /// Send payloads no larger than one chunk as a single request.
    pub whole_file_shortcut: bool,
}

impl UploadOptions {
    pub fn files() -> Self {
        Self {
            chunk_size: FILE_CHUNK_SIZE,
            trailer: None,
            whole_file_shortcut: false,
        }
    }

    pub fn model(model_info: Option<String>) -> Self {
        Self {
            chunk_size: MODEL_CHUNK_SIZE,
            trailer: model_info,
            whole_file_shortcut: true,
        }
    }
}

fn progress_of(name: &str, file_index: usize, file_count: usize, session: &UploadSession) -> UploadProgress {
    UploadProgress {
        file_name: name.to_string(),
        file_index,
        file_count,
        bytes_sent: session.offset(),
        total_bytes: session.total_size(),
        percent: batch_percent(file_index, session.fraction(), file_count),
    }
}

async fn send_cancellable<T: ChunkTransport>(
    transport: &T,
    request: ChunkRequest,
    cancel: &CancellationToken,
) -> Result<T::Response> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("Upload cancelled")),
        result = transport.send_chunk(request) => result,
    }
}

pub fn upload<'a, T: ChunkTransport>(
    transport: &'a T,
    sources: Vec<UploadSource>,
    options: UploadOptions,
    cancel: CancellationToken,
) -> BoxStream<'a, Result<UploadEvent<T::Response>>> {
    let stream = async_stream::try_stream! {
        let file_count = sources.len();

        for (file_index, source) in sources.into_iter().enumerate() {
            let name = source.name.clone();
            let (total_size, mut reader) = source.open().await?;
            let mut session = UploadSession::new(total_size, options.chunk_size, options.trailer.clone())?;

            tracing::info!(
                "Uploading {} ({} bytes) in chunks of {} bytes",
                name,
                total_size,
                options.chunk_size
            );

            if options.whole_file_shortcut && total_size <= options.chunk_size {
                if cancel.is_cancelled() {
                    Err::<(), _>(anyhow!("Upload of {} cancelled", name))?;
                }
                let whole = ChunkSpan { index: 0, offset: 0, len: total_size };
                let request = ChunkRequest {
                    file_name: name.clone(),
                    data: reader.read(whole).await?,
                    offset: 0,
                    total_size,
                    trailer: options.trailer.clone(),
                    single: true,
                };
                let response = send_cancellable(transport, request, &cancel)
                    .await
                    .with_context(|| format!("Failed to upload {}", name))?;
                session.finish();
                yield UploadEvent::Progress(progress_of(&name, file_index, file_count, &session));
                yield UploadEvent::FileUploaded { file_name: name, response: Some(response) };
                continue;
            }

            let mut last_response = None;
            for span in plan_chunks(total_size, options.chunk_size)? {
                if cancel.is_cancelled() {
                    Err::<(), _>(anyhow!("Upload of {} cancelled at offset {}", name, span.offset))?;
                }

                let request = ChunkRequest {
                    file_name: name.clone(),
                    data: reader.read(span).await?,
                    offset: span.offset,
                    total_size,
                    trailer: session.trailer_for(span).map(str::to_owned),
                    single: false,
                };

                tracing::debug!("Sending {} bytes {}..{}", name, span.offset, span.end());
                let response = send_cancellable(transport, request, &cancel)
                    .await
                    .with_context(|| {
                        format!("Failed to upload chunk {}-{} of {}", span.offset, span.end(), name)
                    })?;

                session.acknowledge(span);
                last_response = Some(response);
                yield UploadEvent::Progress(progress_of(&name, file_index, file_count, &session));
            }

            if total_size == 0 {
                yield UploadEvent::Progress(progress_of(&name, file_index, file_count, &session));
            }

            tracing::info!("Finished uploading {}", name);
            yield UploadEvent::FileUploaded { file_name: name, response: last_response };
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    #[derive(Debug, Clone, PartialEq)]
    struct Recorded {
        file_name: String,
        offset: u64,
        len: u64,
        trailer: Option<String>,
        single: bool,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<Recorded>>,
        fail_at_offset: Option<u64>,
    }

    impl RecordingTransport {
        fn failing_at(offset: u64) -> Self {
            Self {
                fail_at_offset: Some(offset),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ChunkTransport for RecordingTransport {
        type Response = u64;

        async fn send_chunk(&self, chunk: ChunkRequest) -> Result<u64> {
            if self.fail_at_offset == Some(chunk.offset) {
                bail!("connection reset");
            }
            let end = chunk.offset + chunk.data.len() as u64;
            self.requests.lock().unwrap().push(Recorded {
                file_name: chunk.file_name,
                offset: chunk.offset,
                len: chunk.data.len() as u64,
                trailer: chunk.trailer,
                single: chunk.single,
                data: chunk.data,
            });
            Ok(end)
        }
    }

    async fn collect<R>(
        stream: BoxStream<'_, Result<UploadEvent<R>>>,
    ) -> (Vec<f64>, Vec<Option<R>>, Option<anyhow::Error>) {
        let mut percents = Vec::new();
        let mut responses = Vec::new();
        let mut stream = stream;
        while let Some(event) = stream.next().await {
            match event {
                Ok(UploadEvent::Progress(p)) => percents.push(p.percent),
                Ok(UploadEvent::FileUploaded { response, .. }) => responses.push(response),
                Err(e) => return (percents, responses, Some(e)),
            }
        }
        (percents, responses, None)
    }

    fn rounded(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| v.round() as u64).collect()
    }

    #[test]
    fn test_plan_covers_payload_without_gaps() {
        for (size, chunk) in [(0, 7), (1, 7), (7, 7), (8, 7), (2_621_440, MIB), (5 * MIB, MIB), (12_345, 1000)] {
            let spans = plan_chunks(size, chunk).unwrap();
            assert_eq!(spans.len() as u64, size.div_ceil(chunk), "size={size} chunk={chunk}");

            let mut expected = 0;
            for (i, span) in spans.iter().enumerate() {
                assert_eq!(span.index, i as u64);
                assert_eq!(span.offset, expected);
                assert!(span.len > 0 && span.len <= chunk);
                expected = span.end();
            }
            assert_eq!(expected, size);
        }
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        assert!(plan_chunks(10, 0).is_err());
        assert!(UploadSession::new(10, 0, None).is_err());
    }

    #[test]
    fn test_trailer_only_on_final_span() {
        let session = UploadSession::new(10, 4, Some("{\"name\":\"yolo\"}".to_string())).unwrap();
        let spans = plan_chunks(10, 4).unwrap();
        assert_eq!(session.trailer_for(spans[0]), None);
        assert_eq!(session.trailer_for(spans[1]), None);
        assert!(session.trailer_for(spans[2]).is_some());
    }

    #[test]
    fn test_batch_percent_weights_files() {
        assert_eq!(batch_percent(0, 0.5, 2), 25.0);
        assert_eq!(batch_percent(1, 0.0, 2), 50.0);
        assert_eq!(batch_percent(1, 1.0, 2), 100.0);
        assert_eq!(batch_percent(2, 1.0, 2), 100.0);
    }

    #[tokio::test]
    async fn test_two_and_a_half_mib_in_one_mib_chunks() {
        let transport = RecordingTransport::default();
        let source = UploadSource::from_bytes("clip.mp4", vec![7u8; 2_621_440]);

        let stream = upload(&transport, vec![source], UploadOptions::files(), CancellationToken::new());
        let (percents, responses, error) = collect(stream).await;

        assert!(error.is_none());
        assert_eq!(rounded(&percents), vec![40, 80, 100]);
        let offsets: Vec<u64> = transport.requests().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1_048_576, 2_097_152]);
        assert_eq!(responses, vec![Some(2_621_440)]);
    }

    #[tokio::test]
    async fn test_empty_file_sends_nothing_and_completes() {
        let transport = RecordingTransport::default();
        let source = UploadSource::from_bytes("empty.txt", Vec::new());

        let stream = upload(&transport, vec![source], UploadOptions::files(), CancellationToken::new());
        let (percents, responses, error) = collect(stream).await;

        assert!(error.is_none());
        assert!(transport.requests().is_empty());
        assert_eq!(percents, vec![100.0]);
        assert_eq!(responses, vec![None]);
    }

    #[tokio::test]
    async fn test_batch_uploads_files_in_order_with_weighted_progress() {
        let transport = RecordingTransport::default();
        let options = UploadOptions {
            chunk_size: 4,
            trailer: None,
            whole_file_shortcut: false,
        };
        let sources = vec![
            UploadSource::from_bytes("a", vec![1u8; 8]),
            UploadSource::from_bytes("b", vec![2u8; 8]),
        ];

        let (percents, _, error) = collect(upload(&transport, sources, options, CancellationToken::new())).await;

        assert!(error.is_none());
        assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        let order: Vec<(String, u64)> = transport
            .requests()
            .into_iter()
            .map(|r| (r.file_name, r.offset))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 4),
                ("b".to_string(), 0),
                ("b".to_string(), 4)
            ]
        );
    }

    #[tokio::test]
    async fn test_chunk_failure_aborts_remaining_upload() {
        let transport = RecordingTransport::failing_at(4);
        let options = UploadOptions {
            chunk_size: 4,
            trailer: None,
            whole_file_shortcut: false,
        };
        let sources = vec![
            UploadSource::from_bytes("a", vec![1u8; 12]),
            UploadSource::from_bytes("b", vec![2u8; 4]),
        ];

        let (percents, responses, error) =
            collect(upload(&transport, sources, options, CancellationToken::new())).await;

        let error = error.expect("upload should fail");
        assert!(format!("{:#}", error).contains("connection reset"));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(percents.len(), 1);
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_model_trailer_rides_on_last_chunk() {
        let transport = RecordingTransport::default();
        let options = UploadOptions {
            chunk_size: 4,
            trailer: Some("{\"model\":1}".to_string()),
            whole_file_shortcut: true,
        };
        let source = UploadSource::from_bytes("model.cvimodel", (0u8..10).collect());

        let (_, _, error) = collect(upload(&transport, vec![source], options, CancellationToken::new())).await;

        assert!(error.is_none());
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| !r.single));
        assert_eq!(requests[0].trailer, None);
        assert_eq!(requests[1].trailer, None);
        assert_eq!(requests[2].trailer.as_deref(), Some("{\"model\":1}"));
        assert_eq!(requests[2].data, vec![8, 9]);
    }

    #[tokio::test]
    async fn test_small_model_uses_single_request() {
        let transport = RecordingTransport::default();
        let source = UploadSource::from_bytes("tiny.cvimodel", vec![3u8; 100]);

        let (percents, responses, error) = collect(upload(
            &transport,
            vec![source],
            UploadOptions::model(Some("{}".to_string())),
            CancellationToken::new(),
        ))
        .await;

        assert!(error.is_none());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].single);
        assert_eq!(requests[0].len, 100);
        assert_eq!(requests[0].trailer.as_deref(), Some("{}"));
        assert_eq!(percents, vec![100.0]);
        assert_eq!(responses, vec![Some(100)]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_further_chunks() {
        let transport = RecordingTransport::default();
        let cancel = CancellationToken::new();
        let options = UploadOptions {
            chunk_size: 4,
            trailer: None,
            whole_file_shortcut: false,
        };
        let source = UploadSource::from_bytes("a", vec![0u8; 16]);
        let mut stream = upload(&transport, vec![source], options, cancel.clone());

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, UploadEvent::Progress(_)));
        cancel.cancel();

        let next = stream.next().await.unwrap();
        assert!(next.is_err());
        assert!(stream.next().await.is_none());
        assert_eq!(transport.requests().len(), 1);
    }

    /// Accepts a chunk and then never answers.
    #[derive(Default)]
    struct StalledTransport {
        started: tokio::sync::Notify,
        completed: Mutex<usize>,
    }

    impl ChunkTransport for StalledTransport {
        type Response = ();

        async fn send_chunk(&self, _chunk: ChunkRequest) -> Result<()> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            *self.completed.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_chunk_in_flight() {
        let transport = StalledTransport::default();
        let cancel = CancellationToken::new();
        let source = UploadSource::from_bytes("a", vec![0u8; 16]);
        let mut stream = upload(&transport, vec![source], UploadOptions::files(), cancel.clone());

        let (next, _) = tokio::join!(stream.next(), async {
            transport.started.notified().await;
            cancel.cancel();
        });

        let error = next.unwrap().unwrap_err();
        assert!(format!("{:#}", error).contains("cancelled"));
        assert!(stream.next().await.is_none());
        assert_eq!(*transport.completed.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reads_chunks_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        file.write_all(&contents).unwrap();
        file.flush().unwrap();

        let transport = RecordingTransport::default();
        let options = UploadOptions {
            chunk_size: 300,
            trailer: None,
            whole_file_shortcut: false,
        };
        let source = UploadSource::from_path(file.path()).unwrap();

        let (_, _, error) = collect(upload(&transport, vec![source], options, CancellationToken::new())).await;

        assert!(error.is_none());
        let sent: Vec<u8> = transport
            .requests()
            .into_iter()
            .flat_map(|r| r.data)
            .collect();
        assert_eq!(sent, contents);
    }
}
