//! HSMS session with the handler.
//!
//! A background task owns the read half of the connection. It answers
//! linktests, acknowledges event reports and hands everything else to the
//! plugin: events through one channel, replies through another.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ph_core::{FuncError, FuncResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::gem;
use crate::hsms::{read_message, write_message, HsmsError, Message, SType, SystemBytes};
use crate::secs::Item;

type Writer = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct Session {
    writer: Writer,
    ids: SystemBytes,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    held: Mutex<Option<Message>>,
    reply_timeout: Duration,
    receiver: JoinHandle<()>,
}

impl Session {
    /// Take over `stream` and start the receiver task.
    pub fn start<S>(stream: S, reply_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(reader, writer.clone(), reply_tx, event_tx));
        Self {
            writer,
            ids: SystemBytes::new(),
            replies: tokio::sync::Mutex::new(reply_rx),
            events: tokio::sync::Mutex::new(event_rx),
            held: Mutex::new(None),
            reply_timeout,
            receiver,
        }
    }

    async fn send(&self, message: &Message) -> FuncResult {
        trace!(message = %message.label(), system = message.system, "sending");
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.reply_timeout, write_message(&mut *writer, message)).await {
            Err(_) => Err(FuncError::Timeout),
            Ok(Err(e)) => {
                warn!("sending {} failed: {}", message.label(), e);
                Err(FuncError::Lan)
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Wait for the reply to the message sent with `system`. Replies to
    /// other messages are dropped.
    pub async fn await_reply(&self, system: u32, label: &str) -> FuncResult<Message> {
        let mut replies = self.replies.lock().await;
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => {
                    debug!("no reply to {} within {:?}", label, self.reply_timeout);
                    return Err(FuncError::Waiting);
                }
                Ok(None) => return Err(FuncError::Lan),
                Ok(Some(reply)) if reply.system == system => return Ok(reply),
                Ok(Some(other)) => {
                    warn!(
                        "dropping {} (system {}) while waiting for the reply to {}",
                        other.label(),
                        other.system,
                        label
                    );
                }
            }
        }
    }

    /// Send primary `SxFy` without waiting. Returns its system bytes.
    pub async fn send_request(&self, stream: u8, function: u8, body: Item) -> FuncResult<u32> {
        let message = Message::data(stream, function, true, self.ids.next(), Some(body));
        self.send(&message).await?;
        Ok(message.system)
    }

    /// Send primary `SxFy` and return the reply.
    pub async fn request(&self, stream: u8, function: u8, body: Item) -> FuncResult<Message> {
        let label = format!("S{}F{}", stream, function);
        let system = self.send_request(stream, function, body).await?;
        let reply = self.await_reply(system, &label).await?;
        debug!("{} answered with {}", label, reply.label());
        Ok(reply)
    }

    /// Send Select.req without waiting. Returns its system bytes.
    pub async fn send_select(&self) -> FuncResult<u32> {
        let message = Message::control(SType::SelectReq, self.ids.next(), 0);
        self.send(&message).await?;
        Ok(message.system)
    }

    /// HSMS select. Returns the select status, 0 when accepted.
    pub async fn select(&self) -> FuncResult<u8> {
        let system = self.send_select().await?;
        let reply = self.await_reply(system, "Select.req").await?;
        select_status(&reply)
    }

    /// Next event report, waiting up to `timeout`. `None` when none arrived.
    pub async fn next_event(&self, timeout: Duration) -> FuncResult<Option<Message>> {
        let held = self.held.lock().take();
        if held.is_some() {
            return Ok(held);
        }
        let mut events = self.events.lock().await;
        match tokio::time::timeout(timeout, events.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(FuncError::Lan),
            Ok(Some(event)) => Ok(Some(event)),
        }
    }

    /// Event report already received, without waiting.
    pub async fn try_next_event(&self) -> FuncResult<Option<Message>> {
        let held = self.held.lock().take();
        if held.is_some() {
            return Ok(held);
        }
        let mut events = self.events.lock().await;
        match events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(FuncError::Lan),
        }
    }

    /// Put an event back; it is returned by the next event call.
    pub fn hold(&self, event: Message) {
        *self.held.lock() = Some(event);
    }
}

/// Status carried by a Select.rsp.
pub fn select_status(reply: &Message) -> FuncResult<u8> {
    if reply.stype != SType::SelectRsp {
        warn!("Select.req answered with {}", reply.label());
        return Err(FuncError::Answer);
    }
    Ok(reply.function)
}

impl Drop for Session {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn reply_to(writer: &Writer, message: Message) -> Result<(), HsmsError> {
    let mut writer = writer.lock().await;
    write_message(&mut *writer, &message).await
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    writer: Writer,
    replies: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<Message>,
) {
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(HsmsError::Body(e)) => {
                warn!("discarding message with bad body: {}", e);
                continue;
            }
            Err(e) => {
                warn!("HSMS receiver stopped: {}", e);
                break;
            }
        };
        trace!(message = %message.label(), system = message.system, "received");

        let forwarded = match message.stype {
            SType::LinktestReq => {
                let answer = Message::control(SType::LinktestRsp, message.system, 0);
                if let Err(e) = reply_to(&writer, answer).await {
                    warn!("answering linktest failed: {}", e);
                    break;
                }
                continue;
            }
            SType::SeparateReq => {
                warn!("handler separated the HSMS session");
                break;
            }
            SType::Data if message.stream == 6 && matches!(message.function, 11 | 13) => {
                if message.wbit {
                    let ack = Message::data(
                        6,
                        message.function + 1,
                        false,
                        message.system,
                        Some(gem::event_ack()),
                    );
                    if let Err(e) = reply_to(&writer, ack).await {
                        warn!("acknowledging event failed: {}", e);
                        break;
                    }
                }
                events.send(message)
            }
            _ => replies.send(message),
        };
        if forwarded.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn session() -> (Session, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (Session::start(ours, Duration::from_secs(1)), theirs)
    }

    #[tokio::test]
    async fn request_gets_matching_reply() {
        let (session, mut handler) = session();
        let peer = tokio::spawn(async move {
            let request = read_message(&mut handler).await.unwrap();
            assert!(request.is_data(1, 3));
            assert!(request.wbit);
            let stale = Message::data(1, 4, false, request.system + 100, None);
            write_message(&mut handler, &stale).await.unwrap();
            let reply = Message::data(1, 4, false, request.system, Some(Item::u4(85)));
            write_message(&mut handler, &reply).await.unwrap();
            handler
        });
        let reply = session.request(1, 3, gem::status_request()).await.unwrap();
        assert_eq!(reply.body, Some(Item::u4(85)));
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_is_waiting() {
        let (session, _handler) = session();
        assert_eq!(
            session.request(1, 13, gem::establish_communication()).await,
            Err(FuncError::Waiting)
        );
    }

    #[tokio::test]
    async fn events_are_acknowledged_and_queued() {
        let (session, mut handler) = session();
        let body = gem::fixtures::plain(gem::ceid::LOT_LOADED);
        let event = Message::data(6, 11, true, 77, Some(body));
        write_message(&mut handler, &event).await.unwrap();

        let ack = read_message(&mut handler).await.unwrap();
        assert!(ack.is_data(6, 12));
        assert_eq!(ack.system, 77);
        assert_eq!(ack.body, Some(Item::binary(0)));

        let queued = session.next_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(queued, Some(event.clone()));

        session.hold(event.clone());
        assert_eq!(session.try_next_event().await.unwrap(), Some(event));
        assert_eq!(session.try_next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn linktest_is_answered() {
        let (_session, mut handler) = session();
        write_message(&mut handler, &Message::control(SType::LinktestReq, 9, 0))
            .await
            .unwrap();
        let answer = read_message(&mut handler).await.unwrap();
        assert_eq!(answer.stype, SType::LinktestRsp);
        assert_eq!(answer.system, 9);
    }

    #[tokio::test]
    async fn select_returns_status() {
        let (session, mut handler) = session();
        let peer = tokio::spawn(async move {
            let request = read_message(&mut handler).await.unwrap();
            assert_eq!(request.stype, SType::SelectReq);
            let answer = Message::control(SType::SelectRsp, request.system, 0);
            write_message(&mut handler, &answer).await.unwrap();
            handler
        });
        assert_eq!(session.select().await, Ok(0));
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_still_collected() {
        let (session, mut handler) = session();
        let system = session.send_request(2, 41, gem::start()).await.unwrap();
        let sent = read_message(&mut handler).await.unwrap();
        assert_eq!(sent.system, system);
        assert_eq!(
            session.await_reply(system, "START").await,
            Err(FuncError::Waiting)
        );

        let reply = Message::data(2, 42, false, system, Some(Item::binary(0)));
        write_message(&mut handler, &reply).await.unwrap();
        assert_eq!(session.await_reply(system, "START").await, Ok(reply));
    }

    #[tokio::test]
    async fn closed_connection_is_lan_error() {
        let (session, handler) = session();
        drop(handler);
        assert_eq!(
            session.next_event(Duration::from_secs(1)).await,
            Err(FuncError::Lan)
        );
    }
}
