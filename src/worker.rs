//! Transfer jobs and the worker threads that run them.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::codec;
use crate::fetch::Fetcher;
use crate::messages::{CompleteMessage, DownloadRequest, ErrorMessage, Operation, UploadRequest};
use crate::progress::{ProgressGate, ProgressReporter};
use crate::remote::RemoteClient;
use crate::store::ObjectStore;
use crate::writer::WriterMessage;
use crate::{Error, Oid, Result};

/// One upload or download request, still in wire form.
///
/// The dispatcher only classifies lines; the worker that takes the job
/// parses the request itself.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Best-effort OID from the envelope, used to label failures when the
    /// payload itself does not parse.
    pub oid: String,
    pub payload: Vec<u8>,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Complete(CompleteMessage),
    Failed(ErrorMessage),
}

impl TransferResult {
    pub fn is_error(&self) -> bool {
        matches!(self, TransferResult::Failed(_))
    }

    pub fn oid(&self) -> &str {
        match self {
            TransferResult::Complete(m) => &m.oid,
            TransferResult::Failed(m) => &m.oid,
        }
    }
}

/// Everything a worker needs, shared read-only across the pool.
pub struct WorkerContext {
    pub client: Arc<dyn RemoteClient>,
    /// Where downloads land.
    pub store: ObjectStore,
    pub fetcher: Fetcher,
    pub gate: ProgressGate,
}

type WorkerFn = fn(usize, Arc<WorkerContext>, Receiver<TransferJob>, Sender<WriterMessage>);

/// A fixed set of worker threads of one kind, fed through one bounded
/// queue.
pub struct WorkerPool {
    jobs: Sender<TransferJob>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers for `operation`, sharing a job queue that holds
    /// at most `count` waiting jobs.
    ///
    /// If a thread cannot be started, the workers already running are shut
    /// down and joined before the error is returned.
    pub fn spawn(
        operation: Operation,
        count: usize,
        ctx: Arc<WorkerContext>,
        results: Sender<WriterMessage>,
    ) -> Result<Self> {
        let worker: WorkerFn = match operation {
            Operation::Download => download_worker,
            Operation::Upload => upload_worker,
        };
        start(count, |id, jobs| {
            let ctx = Arc::clone(&ctx);
            let results = results.clone();
            thread::Builder::new()
                .name(format!("{}-worker-{}", operation, id))
                .spawn(move || worker(id, ctx, jobs, results))
        })
    }

    /// Queue for this pool's jobs. Sending blocks while it is full.
    pub fn jobs(&self) -> &Sender<TransferJob> {
        &self.jobs
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Close the queue, then wait for every worker to drain it and exit.
    pub fn join(self) {
        drop(self.jobs);
        join_all(self.handles);
    }
}

fn start<F>(count: usize, mut spawn_one: F) -> Result<WorkerPool>
where
    F: FnMut(usize, Receiver<TransferJob>) -> std::io::Result<JoinHandle<()>>,
{
    let count = count.max(1);
    let (jobs, queue) = bounded(count);
    let mut handles = Vec::with_capacity(count);
    for id in 0..count {
        match spawn_one(id, queue.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!(error = %e, started = handles.len(), "could not start worker");
                drop(jobs);
                join_all(handles);
                return Err(e.into());
            }
        }
    }
    Ok(WorkerPool { jobs, handles })
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("transfer worker panicked");
        }
    }
}

/// Pull download jobs until the channel closes.
pub fn download_worker(
    id: usize,
    ctx: Arc<WorkerContext>,
    jobs: Receiver<TransferJob>,
    results: Sender<WriterMessage>,
) {
    run_worker(id, Operation::Download, &ctx, &jobs, &results);
}

/// Pull upload jobs until the channel closes.
pub fn upload_worker(
    id: usize,
    ctx: Arc<WorkerContext>,
    jobs: Receiver<TransferJob>,
    results: Sender<WriterMessage>,
) {
    run_worker(id, Operation::Upload, &ctx, &jobs, &results);
}

fn run_worker(
    id: usize,
    operation: Operation,
    ctx: &WorkerContext,
    jobs: &Receiver<TransferJob>,
    results: &Sender<WriterMessage>,
) {
    tracing::debug!(worker = id, %operation, "worker started");

    for job in jobs.iter() {
        let span = tracing::info_span!("transfer", worker = id, oid = %job.oid);
        let _enter = span.enter();

        let result = run_job(operation, ctx, &job, results);
        if results.send(WriterMessage::Result(result)).is_err() {
            tracing::error!("result writer gone, dropping result");
        }
    }

    tracing::debug!(worker = id, "worker exiting");
}

/// Run one job to a terminal result. Never panics and never returns without
/// a result, so every job yields exactly one message.
fn run_job(
    operation: Operation,
    ctx: &WorkerContext,
    job: &TransferJob,
    results: &Sender<WriterMessage>,
) -> TransferResult {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match operation {
        Operation::Download => download(ctx, job, results),
        Operation::Upload => upload(ctx, job, results),
    }));

    match outcome {
        Ok(Ok(complete)) => {
            tracing::info!(%operation, "transfer complete");
            TransferResult::Complete(complete)
        }
        Ok(Err(err)) => {
            let code = match operation {
                Operation::Download => download_error_code(&err),
                Operation::Upload => err.protocol_code(),
            };
            tracing::error!(%operation, code, error = %err, "transfer failed");
            TransferResult::Failed(ErrorMessage::object(job.oid.clone(), code, err.to_string()))
        }
        Err(_) => {
            tracing::error!(%operation, "transfer panicked");
            TransferResult::Failed(ErrorMessage::object(
                job.oid.clone(),
                500,
                format!("internal error during {}", operation),
            ))
        }
    }
}

/// Anything past request validation that fails on a download is the
/// remote's fault from Git LFS's point of view.
fn download_error_code(err: &Error) -> u16 {
    match err {
        Error::MalformedMessage(_) | Error::InvalidOid(_) => 400,
        Error::NotFound(_) => 404,
        _ => 502,
    }
}

fn download(
    ctx: &WorkerContext,
    job: &TransferJob,
    results: &Sender<WriterMessage>,
) -> Result<CompleteMessage> {
    let req: DownloadRequest = codec::decode(&job.payload)?;
    let oid = Oid::from_hex(&req.oid)?;
    tracing::info!(size = req.size, "downloading");

    let access = ctx.client.download_url(&req.oid)?;
    if access.url.trim().is_empty() {
        return Err(Error::EmptyAccessUrl(req.oid));
    }

    let reporter = ProgressReporter::new(req.oid.clone(), req.size, ctx.gate, results.clone());
    let body = ctx.fetcher.open(&access)?;
    let path = ctx.store.import(&oid, body, &mut |n| {
        reporter.report(n as i64);
    })?;
    reporter.finalize();

    Ok(CompleteMessage::new(req.oid, path.to_string_lossy()))
}

fn upload(
    ctx: &WorkerContext,
    job: &TransferJob,
    results: &Sender<WriterMessage>,
) -> Result<CompleteMessage> {
    let req: UploadRequest = codec::decode(&job.payload)?;
    Oid::from_hex(&req.oid)?;
    tracing::info!(size = req.size, path = %req.path.display(), "uploading");

    let reporter = ProgressReporter::new(req.oid.clone(), req.size, ctx.gate, results.clone());
    let descriptor = match ctx.client.progress_upload() {
        Some(uploader) => uploader.register_file_with_progress(&req.oid, &req.path, &mut |n| {
            reporter.report(n as i64);
        })?,
        None => ctx.client.register_file(&req.oid, &req.path)?,
    };
    reporter.finalize();

    Ok(CompleteMessage::new(req.oid, descriptor.name))
}
