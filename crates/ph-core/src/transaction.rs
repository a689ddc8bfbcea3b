//! Resumable message exchanges.
//!
//! A plugin call may stop halfway through a multi-message exchange because
//! the handler has not answered yet. The call then returns
//! [`FuncError::Waiting`] and the framework repeats it. On the repeat the
//! plugin runs the same sequence of `send`/`receive` steps again; a
//! [`Transaction`] replays the steps that already completed (messages are not
//! sent twice, answers that arrived are returned from the cache) and resumes
//! at the first step that did not. Steps left behind by a different operation
//! are dropped when the next one begins.
//!
//! ```rust,ignore
//! let mut trx = self.trx.lock().await;
//! trx.begin(FuncAvailability::START);
//! let result = async {
//!     trx.send(&*self.link, "FULLSITES?").await?;
//!     let answer = trx.receive(&*self.link).await?;
//!     parse(&answer)
//! }.await;
//! trx.settle(result)
//! ```

use crate::availability::FuncAvailability;
use crate::error::{FuncError, FuncResult};
use crate::transport::Transport;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Sent,
    Received(String),
    Srq(u8),
}

/// Replay log of one plugin call.
#[derive(Debug)]
pub struct Transaction {
    steps: Vec<Step>,
    cursor: usize,
    call: FuncAvailability,
    heartbeat: Duration,
}

impl Transaction {
    /// `heartbeat` bounds every receive and send.
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            steps: Vec::new(),
            cursor: 0,
            call: FuncAvailability::empty(),
            heartbeat,
        }
    }

    /// Receive timeout of a single step.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Start (or restart) walking the step sequence of operation `call`.
    pub fn begin(&mut self, call: FuncAvailability) {
        if call != self.call && !self.steps.is_empty() {
            trace!(
                previous = self.call.call_name(),
                "dropping {} steps of an unfinished operation",
                self.steps.len()
            );
            self.steps.clear();
        }
        self.call = call;
        self.cursor = 0;
    }

    /// Whether a previous call left completed steps behind.
    pub fn is_resuming(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Drop all recorded steps.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.cursor = 0;
    }

    fn replay(&mut self) -> Option<Step> {
        let step = self.steps.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(step)
    }

    fn record(&mut self, step: Step) {
        self.steps.truncate(self.cursor);
        self.steps.push(step);
        self.cursor += 1;
    }

    /// Send a message unless it was already sent.
    pub async fn send(&mut self, link: &dyn Transport, msg: &str) -> FuncResult<()> {
        if let Some(step) = self.replay() {
            trace!(step = ?step, "replaying send of {:?}", msg);
            return Ok(());
        }
        link.send(msg, self.heartbeat)
            .await
            .map_err(|e| e.to_func_error(link.interface()))?;
        self.record(Step::Sent);
        Ok(())
    }

    /// Receive a message, or return the one received on an earlier attempt.
    ///
    /// No answer within the heartbeat yields [`FuncError::Waiting`].
    pub async fn receive(&mut self, link: &dyn Transport) -> FuncResult<String> {
        if let Some(Step::Received(answer)) = self.steps.get(self.cursor).cloned() {
            self.cursor += 1;
            return Ok(answer);
        }
        let answer = link
            .receive(self.heartbeat)
            .await
            .map_err(|e| e.to_func_error(link.interface()))?;
        self.record(Step::Received(answer.clone()));
        Ok(answer)
    }

    /// Send `msg` and receive its answer. Without an answer the send is
    /// forgotten as well, so the next attempt asks again.
    pub async fn query(&mut self, link: &dyn Transport, msg: &str) -> FuncResult<String> {
        let start = self.cursor;
        self.send(link, msg).await?;
        match self.receive(link).await {
            Err(e) => {
                self.rewind(start);
                Err(e)
            }
            answer => answer,
        }
    }

    /// Current position, for a later [`Transaction::rewind`].
    pub fn mark(&self) -> usize {
        self.cursor
    }

    /// Forget every step from `mark` on; they run again on the next walk.
    pub fn rewind(&mut self, mark: usize) {
        self.steps.truncate(mark);
        self.cursor = mark.min(self.steps.len());
    }

    /// Test for a service request. A received request is recorded; a missing
    /// one is not, so the next attempt tests again.
    pub async fn test_srq(&mut self, link: &dyn Transport) -> FuncResult<Option<u8>> {
        if let Some(Step::Srq(srq)) = self.steps.get(self.cursor).cloned() {
            self.cursor += 1;
            return Ok(Some(srq));
        }
        let srq = link
            .test_srq()
            .await
            .map_err(|e| e.to_func_error(link.interface()))?;
        if let Some(byte) = srq {
            self.record(Step::Srq(byte));
        }
        Ok(srq)
    }

    /// Wait up to the heartbeat for a service request, recorded like
    /// [`Transaction::test_srq`].
    pub async fn wait_srq(&mut self, link: &dyn Transport) -> FuncResult<Option<u8>> {
        if let Some(Step::Srq(srq)) = self.steps.get(self.cursor).cloned() {
            self.cursor += 1;
            return Ok(Some(srq));
        }
        let srq = link
            .wait_srq(self.heartbeat)
            .await
            .map_err(|e| e.to_func_error(link.interface()))?;
        if let Some(byte) = srq {
            self.record(Step::Srq(byte));
        }
        Ok(srq)
    }

    /// Close the exchange: anything but `Waiting` completes it.
    pub fn settle<T>(&mut self, result: FuncResult<T>) -> FuncResult<T> {
        if !matches!(result, Err(FuncError::Waiting)) {
            self.reset();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterfaceKind;
    use crate::transport::StreamTransport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn waiting_exchange_is_resumed_without_resending() {
        let (host, device) = tokio::io::duplex(256);
        let link = StreamTransport::new(Box::new(device), InterfaceKind::Lan, "\n");
        let mut host = BufReader::new(host);
        let mut trx = Transaction::new(Duration::from_millis(20));

        // first attempt: command goes out, no answer yet
        trx.begin(FuncAvailability::START);
        let first = async {
            trx.send(&link, "FULLSITES?").await?;
            trx.receive(&link).await
        }
        .await;
        let first = trx.settle(first);
        assert_eq!(first, Err(FuncError::Waiting));
        assert!(trx.is_resuming());

        let mut line = String::new();
        host.read_line(&mut line).await.unwrap();
        assert_eq!(line, "FULLSITES?\n");
        host.get_mut().write_all(b"FULLSITES 3\n").await.unwrap();

        // second attempt: send is replayed, answer is read
        trx.begin(FuncAvailability::START);
        let second = async {
            trx.send(&link, "FULLSITES?").await?;
            trx.receive(&link).await
        }
        .await;
        assert_eq!(trx.settle(second).unwrap(), "FULLSITES 3");
        assert!(!trx.is_resuming());

        // nothing was sent twice
        let mut buf = String::new();
        let res =
            tokio::time::timeout(Duration::from_millis(20), host.read_line(&mut buf)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn cached_answer_is_replayed_after_later_wait() {
        let (host, device) = tokio::io::duplex(256);
        let link = StreamTransport::new(Box::new(device), InterfaceKind::Lan, "\n");
        let mut host = BufReader::new(host);
        let mut trx = Transaction::new(Duration::from_millis(20));
        host.get_mut().write_all(b"ECHO:1\n").await.unwrap();

        trx.begin(FuncAvailability::START);
        let r = async {
            trx.send(&link, "BINON 1").await?;
            let echo = trx.receive(&link).await?;
            trx.send(&link, "ECHOOK").await?;
            trx.receive(&link).await.map(|ack| (echo, ack))
        }
        .await;
        assert_eq!(trx.settle(r), Err(FuncError::Waiting));

        host.get_mut().write_all(b"DONE\n").await.unwrap();
        trx.begin(FuncAvailability::START);
        let r = async {
            trx.send(&link, "BINON 1").await?;
            let echo = trx.receive(&link).await?;
            trx.send(&link, "ECHOOK").await?;
            trx.receive(&link).await.map(|ack| (echo, ack))
        }
        .await;
        assert_eq!(trx.settle(r).unwrap(), ("ECHO:1".to_string(), "DONE".to_string()));

        let mut sent = String::new();
        host.read_line(&mut sent).await.unwrap();
        assert_eq!(sent, "BINON 1\n");
        sent.clear();
        host.read_line(&mut sent).await.unwrap();
        assert_eq!(sent, "ECHOOK\n");
    }

    #[tokio::test]
    async fn unanswered_query_is_sent_again() {
        let (host, device) = tokio::io::duplex(256);
        let link = StreamTransport::new(Box::new(device), InterfaceKind::Lan, "\n");
        let mut host = BufReader::new(host);
        let mut trx = Transaction::new(Duration::from_millis(20));

        trx.begin(FuncAvailability::START);
        let first = trx.query(&link, "FR?").await;
        assert_eq!(trx.settle(first), Err(FuncError::Waiting));
        assert!(!trx.is_resuming());

        host.get_mut().write_all(b"FR 0\n").await.unwrap();
        trx.begin(FuncAvailability::START);
        let second = trx.query(&link, "FR?").await;
        assert_eq!(trx.settle(second).unwrap(), "FR 0");

        let mut line = String::new();
        host.read_line(&mut line).await.unwrap();
        host.read_line(&mut line).await.unwrap();
        assert_eq!(line, "FR?\nFR?\n");
    }

    #[tokio::test]
    async fn rewind_repeats_steps_after_mark() {
        let (host, device) = tokio::io::duplex(256);
        let link = StreamTransport::new(Box::new(device), InterfaceKind::Lan, "\n");
        let mut host = BufReader::new(host);
        let mut trx = Transaction::new(Duration::from_millis(20));

        trx.begin(FuncAvailability::START);
        trx.send(&link, "TESTKIND?").await.unwrap();
        let mark = trx.mark();
        trx.send(&link, "BINON 1").await.unwrap();
        trx.rewind(mark);
        trx.send(&link, "BINON 1").await.unwrap();

        let mut sent = String::new();
        for _ in 0..3 {
            host.read_line(&mut sent).await.unwrap();
        }
        assert_eq!(sent, "TESTKIND?\nBINON 1\nBINON 1\n");
    }

    #[tokio::test]
    async fn another_operation_starts_fresh() {
        let mut trx = Transaction::new(Duration::from_millis(10));
        trx.begin(FuncAvailability::START);
        trx.record(Step::Sent);
        trx.begin(FuncAvailability::START);
        assert!(trx.is_resuming());

        trx.begin(FuncAvailability::BIN);
        assert!(!trx.is_resuming());
    }

    #[tokio::test]
    async fn errors_other_than_waiting_reset() {
        let mut trx = Transaction::new(Duration::from_millis(10));
        trx.record(Step::Sent);
        let r: FuncResult<()> = Err(FuncError::Answer);
        assert_eq!(trx.settle(r), Err(FuncError::Answer));
        assert!(!trx.is_resuming());
    }
}
