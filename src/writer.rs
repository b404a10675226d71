//! The single owner of the agent's output stream.
//!
//! Workers and their progress reporters never write to stdout themselves;
//! they send [`WriterMessage`]s here and one thread encodes and flushes them
//! one at a time, so lines can never interleave.

use crossbeam_channel::Receiver;
use std::io::{self, BufWriter, Write};
use std::thread::{self, JoinHandle};

use crate::codec;
use crate::messages::ProgressMessage;
use crate::worker::TransferResult;
use crate::{Error, Result};

/// Anything destined for the output stream once the session is running.
#[derive(Debug)]
pub enum WriterMessage {
    /// Terminal outcome of one job.
    Result(TransferResult),
    /// Advisory progress for an in-flight job.
    Progress(ProgressMessage),
}

/// Counts of what the writer put on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub completed: usize,
    pub failed: usize,
    pub progress: usize,
}

/// Handle to the writer thread.
pub struct ResultWriter {
    handle: JoinHandle<Result<WriterStats>>,
}

impl ResultWriter {
    /// Start the writer thread. It runs until every sender for `messages`
    /// has been dropped and the channel is drained.
    pub fn spawn<W>(output: W, messages: Receiver<WriterMessage>) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("result-writer".into())
            .spawn(move || write_all(output, messages))?;
        Ok(ResultWriter { handle })
    }

    /// Wait for the writer to drain and flush everything.
    pub fn join(self) -> Result<WriterStats> {
        self.handle.join().unwrap_or_else(|_| {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "result writer panicked",
            )))
        })
    }
}

fn write_all<W: Write>(output: W, messages: Receiver<WriterMessage>) -> Result<WriterStats> {
    let mut out = BufWriter::new(output);
    let mut stats = WriterStats::default();
    let mut failure: Option<Error> = None;

    for message in messages.iter() {
        // Keep draining after a failed write so no sender ever blocks on us.
        if failure.is_some() {
            continue;
        }

        let written = match &message {
            WriterMessage::Result(TransferResult::Complete(m)) => codec::write_message(&mut out, m),
            WriterMessage::Result(TransferResult::Failed(m)) => codec::write_message(&mut out, m),
            WriterMessage::Progress(m) => codec::write_message(&mut out, m),
        }
        .and_then(|()| out.flush().map_err(Error::from));

        match written {
            Ok(()) => match message {
                WriterMessage::Result(TransferResult::Complete(_)) => stats.completed += 1,
                WriterMessage::Result(TransferResult::Failed(_)) => stats.failed += 1,
                WriterMessage::Progress(_) => stats.progress += 1,
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to write to git-lfs, discarding further output");
                failure = Some(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CompleteMessage, ErrorMessage};
    use crossbeam_channel::unbounded;
    use std::sync::{Arc, Mutex};

    /// A `Write` that appends into a shared buffer.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writes_in_receipt_order() {
        let buf = SharedBuf::default();
        let (tx, rx) = unbounded();
        let writer = ResultWriter::spawn(buf.clone(), rx).unwrap();

        tx.send(WriterMessage::Progress(ProgressMessage::new("a", 1, 1))).unwrap();
        tx.send(WriterMessage::Result(TransferResult::Complete(CompleteMessage::new("a", "p"))))
            .unwrap();
        tx.send(WriterMessage::Result(TransferResult::Failed(ErrorMessage::object("b", 502, "x"))))
            .unwrap();
        drop(tx);

        let stats = writer.join().unwrap();
        assert_eq!(
            stats,
            WriterStats {
                completed: 1,
                failed: 1,
                progress: 1
            }
        );

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(r#""event":"progress""#));
        assert!(lines[1].contains(r#""path":"p""#));
        assert!(lines[2].contains(r#""code":502"#));
    }

    #[test]
    fn test_write_failure_keeps_draining() {
        let (tx, rx) = unbounded();
        let writer = ResultWriter::spawn(BrokenPipe, rx).unwrap();

        for i in 0..100 {
            tx.send(WriterMessage::Progress(ProgressMessage::new("a", i + 1, 1)))
                .unwrap();
        }
        drop(tx);

        assert!(matches!(writer.join(), Err(Error::Io(_))));
    }
}
