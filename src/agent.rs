//! The custom transfer protocol state machine.
//!
//! A session moves through `AwaitInit → Initializing → Running → Draining →
//! Terminated`. Only failures before `Running` are fatal; after that every
//! problem is reported against the object it concerns and the loop carries
//! on.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::codec::{self, Line, LineReader};
use crate::config::TransferSettings;
use crate::fetch::Fetcher;
use crate::messages::{Envelope, ErrorMessage, Event, InitAck, InitMessage, Operation};
use crate::remote::{RemoteClient, RemoteResolver};
use crate::store::ObjectStore;
use crate::worker::{TransferJob, TransferResult, WorkerContext, WorkerPool};
use crate::writer::{ResultWriter, WriterMessage, WriterStats};
use crate::{Error, Result};

/// Where a session is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitInit,
    Initializing,
    Running,
    Draining,
    Terminated,
}

/// What happened during one run of the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub operation: Option<Operation>,
    pub workers: usize,
    /// Lines handed to workers.
    pub jobs: usize,
    /// Lines skipped while running: unknown events, a repeated init, jobs
    /// for the other direction.
    pub ignored: usize,
    /// Undecodable or oversized lines answered with an error.
    pub rejected: usize,
    /// Lines discarded after terminate.
    pub drained: usize,
    pub terminated: bool,
    pub writer: WriterStats,
}

/// Everything fixed by a successful init.
struct Session {
    operation: Operation,
    client: Arc<dyn RemoteClient>,
    workers: usize,
}

/// Runs one custom transfer session over a pair of byte streams.
pub struct TransferAgent<R> {
    resolver: R,
    store: ObjectStore,
    settings: TransferSettings,
}

impl<R: RemoteResolver> TransferAgent<R> {
    /// `store` is the local LFS object directory downloads land in.
    pub fn new(resolver: R, store: ObjectStore, settings: TransferSettings) -> Self {
        TransferAgent {
            resolver,
            store,
            settings,
        }
    }

    /// Serve a whole session: handshake, jobs, then an orderly shutdown once
    /// `input` ends.
    ///
    /// Returns an error if the handshake fails (after reporting it on
    /// `output`), if reading `input` fails, or if `output` breaks.
    pub fn run<I, W>(&self, input: I, mut output: W) -> Result<RunSummary>
    where
        I: BufRead,
        W: Write + Send + 'static,
    {
        let mut state = State::AwaitInit;
        let mut lines = LineReader::new(input, self.settings.max_line_bytes);

        let init = match read_init(&mut lines) {
            Ok(init) => init,
            Err(e) => return fail_init(&mut output, e),
        };

        advance(&mut state, State::Initializing);
        let session = match self.initialize(&init) {
            Ok(session) => session,
            Err(e) => return fail_init(&mut output, e),
        };

        let (result_tx, result_rx) = unbounded();
        let ctx = Arc::new(WorkerContext {
            client: session.client,
            store: self.store.clone(),
            fetcher: Fetcher::new(self.settings.timeout()),
            gate: self.settings.gate(),
        });
        let pool = match WorkerPool::spawn(
            session.operation,
            session.workers,
            ctx,
            result_tx.clone(),
        ) {
            Ok(pool) => pool,
            Err(e) => return fail_init(&mut output, e),
        };

        let writer = match acknowledge(output, result_rx) {
            Ok(writer) => writer,
            Err(e) => {
                pool.join();
                return Err(e);
            }
        };
        advance(&mut state, State::Running);

        let mut summary = RunSummary {
            operation: Some(session.operation),
            workers: pool.size(),
            ..Default::default()
        };

        let pumped = pump(
            &mut lines,
            &mut state,
            session.operation,
            pool.jobs(),
            &result_tx,
            &mut summary,
        );

        advance(&mut state, State::Terminated);
        drop(result_tx);
        pool.join();
        summary.writer = writer.join()?;

        if let Err(e) = pumped {
            tracing::error!(error = %e, "failed reading from git-lfs");
            return Err(e.into());
        }

        tracing::info!(
            jobs = summary.jobs,
            completed = summary.writer.completed,
            failed = summary.writer.failed,
            ignored = summary.ignored,
            drained = summary.drained,
            "transfer session finished"
        );
        Ok(summary)
    }

    fn initialize(&self, init: &InitMessage) -> Result<Session> {
        let operation = init.operation()?;
        let client = self.resolver.resolve(&init.remote)?;
        let workers = init.worker_count(self.settings.concurrency, self.settings.max_workers);

        tracing::info!(
            %operation,
            remote = %init.remote,
            concurrent = init.concurrent,
            workers,
            "transfer session initialized"
        );
        Ok(Session {
            operation,
            client,
            workers,
        })
    }
}

fn advance(state: &mut State, next: State) {
    tracing::debug!(from = ?state, to = ?next, "state transition");
    *state = next;
}

fn read_init<I: BufRead>(lines: &mut LineReader<I>) -> Result<InitMessage> {
    let line = match lines.next_line()? {
        None => return Err(Error::Protocol("stdin closed before init message".into())),
        Some(Line::Oversized { len, .. }) => {
            return Err(Error::Protocol(format!(
                "init message too large ({} bytes)",
                len
            )))
        }
        Some(Line::Data(line)) => line,
    };

    let init: InitMessage = codec::decode(line)?;
    if init.event != "init" {
        return Err(Error::Protocol(format!(
            "expected 'init' message, got '{}'",
            init.event
        )));
    }
    Ok(init)
}

/// Send the init ack, then hand `output` to the result writer.
fn acknowledge<W>(mut output: W, results: Receiver<WriterMessage>) -> Result<ResultWriter>
where
    W: Write + Send + 'static,
{
    codec::write_message(&mut output, &InitAck {})?;
    output.flush()?;
    ResultWriter::spawn(output, results)
}

/// Report a failed handshake to Git LFS and hand the error back.
fn fail_init<W: Write>(output: &mut W, err: Error) -> Result<RunSummary> {
    tracing::error!(error = %err, "transfer init failed");
    let message = ErrorMessage::fatal(400, err.to_string());
    if let Err(e) = codec::write_message(output, &message).and_then(|()| Ok(output.flush()?)) {
        tracing::error!(error = %e, "could not report init failure");
    }
    Err(err)
}

/// Feed stdin lines to the workers until end of input.
fn pump<I: BufRead>(
    lines: &mut LineReader<I>,
    state: &mut State,
    operation: Operation,
    jobs: &Sender<TransferJob>,
    results: &Sender<WriterMessage>,
    summary: &mut RunSummary,
) -> io::Result<()> {
    while let Some(line) = lines.next_line()? {
        let line = match line {
            Line::Oversized { len, head } => {
                if *state == State::Draining {
                    summary.drained += 1;
                    continue;
                }
                let oid = codec::oid_hint(head).unwrap_or_default();
                tracing::warn!(len, oid, "rejecting oversized protocol line");
                summary.rejected += 1;
                reject(
                    results,
                    ErrorMessage::object(oid, 400, format!("message too large ({} bytes)", len)),
                );
                continue;
            }
            Line::Data(line) => line,
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if *state == State::Draining {
            summary.drained += 1;
            continue;
        }
        if codec::is_terminate(line) {
            begin_draining(state, summary);
            continue;
        }

        let envelope = match codec::decode_envelope(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable protocol line");
                summary.rejected += 1;
                reject(results, ErrorMessage::object("", 400, e.to_string()));
                continue;
            }
        };

        match envelope.event() {
            Event::Upload if operation == Operation::Upload => {
                enqueue(jobs, &envelope, line, summary)?
            }
            Event::Download if operation == Operation::Download => {
                enqueue(jobs, &envelope, line, summary)?
            }
            Event::Terminate => begin_draining(state, summary),
            Event::Init => {
                tracing::warn!("ignoring repeated init message");
                summary.ignored += 1;
            }
            other => {
                tracing::debug!(event = ?other, %operation, "ignoring message");
                summary.ignored += 1;
            }
        }
    }
    Ok(())
}

fn reject(results: &Sender<WriterMessage>, failed: ErrorMessage) {
    if results
        .send(WriterMessage::Result(TransferResult::Failed(failed)))
        .is_err()
    {
        tracing::error!("result writer gone");
    }
}

fn begin_draining(state: &mut State, summary: &mut RunSummary) {
    tracing::info!("terminate received, draining remaining input");
    summary.terminated = true;
    advance(state, State::Draining);
}

/// Blocks while every worker is busy and the queue is full.
fn enqueue(
    jobs: &Sender<TransferJob>,
    envelope: &Envelope,
    line: &[u8],
    summary: &mut RunSummary,
) -> io::Result<()> {
    let job = TransferJob {
        oid: envelope.oid().unwrap_or_default().to_string(),
        payload: line.to_vec(),
    };
    tracing::debug!(oid = %job.oid, "queueing transfer");
    jobs.send(job).map_err(|_| {
        io::Error::new(io::ErrorKind::BrokenPipe, "all transfer workers exited")
    })?;
    summary.jobs += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{AccessUrl, ObjectDescriptor};
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct NamedClient;

    impl RemoteClient for NamedClient {
        fn download_url(&self, _oid: &str) -> Result<AccessUrl> {
            Ok(AccessUrl::new(""))
        }

        fn register_file(&self, oid: &str, path: &Path) -> Result<ObjectDescriptor> {
            Ok(ObjectDescriptor {
                id: oid.into(),
                name: path.display().to_string(),
                size: 0,
            })
        }
    }

    fn resolver(_remote: &str) -> Result<Arc<dyn RemoteClient>> {
        Ok(Arc::new(NamedClient))
    }

    fn run(input: &str) -> (Result<RunSummary>, Vec<serde_json::Value>, TempDir) {
        let td = TempDir::new().unwrap();
        let agent = TransferAgent::new(
            resolver,
            ObjectStore::new(td.path()),
            TransferSettings::default(),
        );
        let out = SharedBuf::default();
        let result = agent.run(Cursor::new(input.to_string()), out.clone());
        (result, out.lines(), td)
    }

    fn oid(c: char) -> String {
        c.to_string().repeat(64)
    }

    #[test]
    fn test_upload_session() {
        let input = format!(
            "{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload","remote":"origin","concurrent":true,"concurrenttransfers":2}"#,
            format!(r#"{{"event":"upload","oid":"{}","size":7,"path":"f.txt"}}"#, oid('a')),
            r#"{"event":"terminate"}"#
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();

        assert_eq!(lines[0], serde_json::json!({}));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["event"], "complete");
        assert_eq!(lines[1]["oid"], oid('a'));
        assert_eq!(lines[1]["path"], "f.txt");

        assert_eq!(summary.operation, Some(Operation::Upload));
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.jobs, 1);
        assert!(summary.terminated);
        assert_eq!(summary.writer.completed, 1);
    }

    #[test]
    fn test_bad_operation_is_fatal() {
        let input = concat!(
            r#"{"event":"init","operation":"bogus"}"#,
            "\n",
            r#"{"event":"upload","oid":"x","size":1,"path":"p"}"#,
            "\n"
        );
        let (result, lines, _td) = run(input);

        assert!(result.is_err());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "error");
        assert_eq!(lines[0]["error"]["code"], 400);
    }

    #[test]
    fn test_init_failures() {
        for input in ["", "not json\n", "{\"event\":\"upload\",\"oid\":\"a\"}\n"] {
            let (result, lines, _td) = run(input);
            assert!(result.is_err(), "input {:?} should fail", input);
            assert_eq!(lines.len(), 1);
            assert_eq!(lines[0]["error"]["code"], 400);
        }
    }

    #[test]
    fn test_unresolvable_remote_is_fatal() {
        let td = TempDir::new().unwrap();
        let failing = |_: &str| -> Result<Arc<dyn RemoteClient>> {
            Err(Error::Config("no remote configured".into()))
        };
        let agent = TransferAgent::new(failing, ObjectStore::new(td.path()), TransferSettings::default());
        let out = SharedBuf::default();
        let result = agent.run(
            Cursor::new(r#"{"event":"init","operation":"download"}"#.to_string()),
            out.clone(),
        );

        assert!(matches!(result, Err(Error::Config(_))));
        let lines = out.lines();
        assert_eq!(lines[0]["event"], "error");
        assert!(lines[0]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no remote configured"));
    }

    #[test]
    fn test_empty_download_url_keeps_loop_alive() {
        let input = format!(
            "{}\n{}\n{}\n",
            r#"{"event":"init","operation":"download","concurrenttransfers":1}"#,
            format!(r#"{{"event":"download","oid":"{}","size":7}}"#, oid('b')),
            format!(r#"{{"event":"download","oid":"{}","size":7}}"#, oid('c')),
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();

        assert_eq!(summary.jobs, 2);
        assert!(!summary.terminated);
        let errors: Vec<_> = lines[1..].iter().filter(|l| l.get("error").is_some()).collect();
        assert_eq!(errors.len(), 2);
        for e in errors {
            assert_eq!(e["event"], "complete");
            assert_eq!(e["error"]["code"], 502);
        }
    }

    #[test]
    fn test_malformed_job_line() {
        let input = format!(
            "{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload"}"#,
            r#"{"event":"upload","oid":"#,
            format!(r#"{{"event":"upload","oid":"{}","size":1,"path":"ok"}}"#, oid('d')),
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();

        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.jobs, 1);
        let failed: Vec<_> = lines.iter().filter(|l| l.get("error").is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].get("oid").is_none());
        assert_eq!(failed[0]["error"]["code"], 400);
        assert!(lines.iter().any(|l| l["oid"] == oid('d') && l["path"] == "ok"));
    }

    #[test]
    fn test_terminate_drains_following_lines() {
        let input = format!(
            "{}\n{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload"}"#,
            r#"{"event":"terminate"}"#,
            format!(r#"{{"event":"upload","oid":"{}","size":1,"path":"late"}}"#, oid('e')),
            r#"{"event":"terminate"}"#,
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();

        assert_eq!(lines, vec![serde_json::json!({})]);
        assert_eq!(summary.jobs, 0);
        assert_eq!(summary.drained, 2);
        assert!(summary.terminated);
    }

    #[test]
    fn test_escaped_terminate_still_recognised() {
        let input = concat!(
            r#"{"event":"init","operation":"upload"}"#,
            "\n",
            r#"{"event":"\u0074erminate"}"#,
            "\n",
            r#"{"event":"upload","oid":"x","size":1,"path":"p"}"#,
            "\n"
        );
        let (result, _lines, _td) = run(input);
        let summary = result.unwrap();
        assert!(summary.terminated);
        assert_eq!(summary.jobs, 0);
    }

    #[test]
    fn test_terminate_word_in_payload_is_not_terminate() {
        let input = format!(
            "{}\n{}\n",
            r#"{"event":"init","operation":"upload"}"#,
            format!(
                r#"{{"event":"upload","oid":"{}","size":1,"path":"terminate"}}"#,
                oid('f')
            ),
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();
        assert!(!summary.terminated);
        assert_eq!(summary.jobs, 1);
        assert_eq!(lines[1]["event"], "complete");
    }

    #[test]
    fn test_ignored_lines() {
        let input = format!(
            "{}\n\n{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload"}"#,
            r#"{"event":"init","operation":"upload"}"#,
            r#"{"event":"download","oid":"x","size":1}"#,
            r#"{"event":"something-new"}"#,
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();
        assert_eq!(summary.ignored, 3);
        assert_eq!(summary.jobs, 0);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_oversized_line_rejected() {
        let td = TempDir::new().unwrap();
        let settings = TransferSettings {
            max_line_bytes: 256,
            ..Default::default()
        };
        let agent = TransferAgent::new(resolver, ObjectStore::new(td.path()), settings);
        let named = format!(
            r#"{{"event":"upload","oid":"{}","size":1,"path":"{}"}}"#,
            oid('a'),
            "p".repeat(1024)
        );
        let unnamed = format!(
            r#"{{"event":"upload","path":"{}","oid":"{}","size":1}}"#,
            "p".repeat(1024),
            oid('c')
        );
        let input = format!(
            "{}\n{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload"}"#,
            named,
            unnamed,
            format!(r#"{{"event":"upload","oid":"{}","size":1,"path":"small"}}"#, oid('b')),
        );
        let out = SharedBuf::default();
        let summary = agent.run(Cursor::new(input), out.clone()).unwrap();

        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.ignored, 0);
        assert_eq!(summary.jobs, 1);

        let lines = out.lines();
        assert_eq!(lines.len(), 4);
        let failed: Vec<_> = lines.iter().filter(|l| l.get("error").is_some()).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|l| l["error"]["code"] == 400));
        assert!(failed.iter().any(|l| l["oid"] == oid('a')));
        assert!(failed.iter().any(|l| l.get("oid").is_none()));
        assert!(lines.iter().any(|l| l["oid"] == oid('b') && l["path"] == "small"));
    }

    #[test]
    fn test_huge_worker_request_is_capped() {
        let input = format!(
            "{}\n{}\n{}\n",
            r#"{"event":"init","operation":"upload","concurrenttransfers":9223372036854775807}"#,
            format!(r#"{{"event":"upload","oid":"{}","size":1,"path":"p"}}"#, oid('a')),
            r#"{"event":"terminate"}"#
        );
        let (result, lines, _td) = run(&input);
        let summary = result.unwrap();

        assert_eq!(summary.workers, TransferSettings::default().max_workers);
        assert_eq!(lines[0], serde_json::json!({}));
        assert_eq!(summary.writer.completed, 1);

        let td = TempDir::new().unwrap();
        let settings = TransferSettings {
            max_workers: 2,
            ..Default::default()
        };
        let agent = TransferAgent::new(resolver, ObjectStore::new(td.path()), settings);
        let summary = agent
            .run(Cursor::new(input), SharedBuf::default())
            .unwrap();
        assert_eq!(summary.workers, 2);
    }

    struct FailingReader;

    impl io::Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "stdin exploded"))
        }
    }

    #[test]
    fn test_stdin_error_after_init_surfaces() {
        let td = TempDir::new().unwrap();
        let agent = TransferAgent::new(resolver, ObjectStore::new(td.path()), TransferSettings::default());
        let init = Cursor::new(b"{\"event\":\"init\",\"operation\":\"upload\"}\n".to_vec());
        let input = io::BufReader::new(io::Read::chain(init, FailingReader));
        let out = SharedBuf::default();

        let err = agent.run(input, out.clone()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(out.lines(), vec![serde_json::json!({})]);
    }
}
