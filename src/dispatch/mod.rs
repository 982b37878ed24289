use crate::binding::redact;
use crate::connection::{PushError, Session};
use crate::events::Notification;
use crate::host::{HostHandle, HostTask};
use crate::protocol::{Command, Frame, FrameReader, ProtocolError};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};

/// Idle window before the client sends an unsolicited heartbeat.
pub const READ_TIMEOUT: Duration = Duration::from_secs(130);

const PUSH_TOKEN_FIELD: &str = "token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The server closed the stream.
    PeerClosed,
    /// `Session::disconnect` was called locally.
    Disconnected,
}

/// Routes decoded frames. Anything touching host state is posted to the host
/// context rather than handled on the session worker.
#[derive(Clone)]
pub struct Dispatcher {
    host: HostHandle,
    push_token: Arc<Mutex<Option<String>>>,
}

impl Dispatcher {
    pub fn new(host: HostHandle) -> Self {
        Self {
            host,
            push_token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn push_token(&self) -> Option<String> {
        self.push_token.lock().unwrap().clone()
    }

    pub fn handle(&self, frame: &Frame) {
        tracing::debug!(cmd = %frame.command, len = frame.payload.len(), "frame received");
        match frame.command {
            Command::Token => match decode_push_token(&frame.payload) {
                Ok(token) => {
                    tracing::info!(push_token = %redact(&token), "push token assigned");
                    *self.push_token.lock().unwrap() = Some(token.clone());
                    self.host.post(HostTask::BindPushToken(token));
                }
                Err(err) => tracing::error!(error = %err, "ignoring TOKEN frame"),
            },
            Command::Push => match decode_notification(&frame.payload) {
                Ok(notification) => {
                    tracing::info!(kind = %notification.kind, uid = %notification.uid, "push notification received");
                    self.host.post(HostTask::Notify(notification));
                }
                Err(err) => tracing::error!(error = %err, "ignoring PUSH frame"),
            },
            Command::Heartbeat => tracing::debug!("heartbeat acknowledged"),
            Command::Register | Command::Unknown(_) => {
                tracing::warn!(cmd = %frame.command, code = frame.command.code(), "unexpected command ignored");
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(rename = "token", default)]
    token: String,
}

pub fn decode_push_token(payload: &[u8]) -> Result<String, PushError> {
    let text = std::str::from_utf8(payload).map_err(|err| PushError::Decode(err.to_string()))?;
    let parsed: TokenPayload =
        serde_json::from_str(text).map_err(|err| PushError::Decode(err.to_string()))?;
    if parsed.token.is_empty() {
        return Err(PushError::Decode(format!("missing \"{PUSH_TOKEN_FIELD}\" field")));
    }
    Ok(parsed.token)
}

pub fn decode_notification(payload: &[u8]) -> Result<Notification, PushError> {
    let text = std::str::from_utf8(payload).map_err(|err| PushError::Decode(err.to_string()))?;
    serde_json::from_str(text).map_err(|err| PushError::Decode(err.to_string()))
}

/// Reads and dispatches frames until the peer closes, the session is
/// disconnected locally, or an I/O error occurs. Every successfully handled
/// frame is answered with a heartbeat, as is every idle `READ_TIMEOUT`.
/// Malformed frames and undecodable payloads are logged and skipped.
pub async fn run_message_loop<S>(
    session: &Session<S>,
    reader: &mut FrameReader<ReadHalf<S>>,
    dispatcher: &Dispatcher,
) -> Result<LoopExit, PushError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let read = tokio::select! {
            biased;
            _ = session.wait_closed() => return Ok(LoopExit::Disconnected),
            read = tokio::time::timeout(READ_TIMEOUT, reader.next_frame()) => read,
        };

        match read {
            Err(_) => {
                tracing::debug!(session_id = %session.id(), "idle read timeout, sending heartbeat");
                session.send(Command::Heartbeat, &[]).await?;
            }
            Ok(Ok(frame)) => {
                dispatcher.handle(&frame);
                session.send(Command::Heartbeat, &[]).await?;
            }
            Ok(Err(ProtocolError::ConnectionClosed)) => {
                tracing::warn!(session_id = %session.id(), "push server closed the connection");
                return Ok(LoopExit::PeerClosed);
            }
            Ok(Err(err @ (ProtocolError::MalformedHeader { .. } | ProtocolError::FrameTooLarge { .. }))) => {
                tracing::warn!(session_id = %session.id(), error = %err, "dropping malformed frame");
            }
            Ok(Err(ProtocolError::Io(err))) => {
                if !session.is_open() {
                    return Ok(LoopExit::Disconnected);
                }
                return Err(PushError::Io(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_frame;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<HostTask>) {
        let (handle, rx) = test_host_handle();
        (Dispatcher::new(handle), rx)
    }

    fn test_host_handle() -> (HostHandle, mpsc::UnboundedReceiver<HostTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HostHandle::from_sender(tx), rx)
    }

    fn open() -> (
        Arc<Session<DuplexStream>>,
        FrameReader<ReadHalf<DuplexStream>>,
        FrameReader<ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let (session, reader) = Session::open(client);
        let (peer_read, peer_write) = tokio::io::split(server);
        (session, reader, FrameReader::new(peer_read), peer_write)
    }

    #[test]
    fn token_payload_requires_token_field() {
        assert_eq!(decode_push_token(br#"{"token":"abc","x":1}"#).unwrap(), "abc");
        assert!(matches!(decode_push_token(br#"{"other":1}"#), Err(PushError::Decode(_))));
        assert!(matches!(decode_push_token(&[0xff, 0xfe]), Err(PushError::Decode(_))));
    }

    #[test]
    fn token_frame_stores_token_and_posts_binding() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle(&Frame {
            command: Command::Token,
            payload: br#"{"token":"abc"}"#.to_vec(),
        });
        assert_eq!(dispatcher.push_token().as_deref(), Some("abc"));
        assert_eq!(rx.try_recv().unwrap(), HostTask::BindPushToken("abc".to_string()));
    }

    #[test]
    fn corrupt_push_frame_posts_nothing() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle(&Frame {
            command: Command::Push,
            payload: b"{not json".to_vec(),
        });
        dispatcher.handle(&Frame {
            command: Command::Unknown(9),
            payload: Vec::new(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_sends_one_heartbeat_and_keeps_running() {
        let (session, mut reader, mut peer_read, _peer_write) = open();
        let (dispatcher, _rx) = dispatcher();
        let loop_session = session.clone();
        let task = tokio::spawn(async move {
            run_message_loop(&loop_session, &mut reader, &dispatcher).await
        });

        let started = tokio::time::Instant::now();
        let frame = peer_read.next_frame().await.unwrap();
        assert_eq!(frame.command, Command::Heartbeat);
        assert!(frame.payload.is_empty());
        assert!(started.elapsed() >= READ_TIMEOUT);

        let no_second = tokio::time::timeout(READ_TIMEOUT / 2, peer_read.next_frame()).await;
        assert!(no_second.is_err());
        assert!(!task.is_finished());

        session.disconnect().await;
        assert_eq!(task.await.unwrap().unwrap(), LoopExit::Disconnected);
    }

    #[tokio::test]
    async fn each_frame_is_echoed_with_heartbeat_and_bad_frames_do_not_end_loop() {
        let (session, mut reader, mut peer_read, mut peer_write) = open();
        let (dispatcher, mut rx) = dispatcher();
        let loop_session = session.clone();
        let task = tokio::spawn(async move {
            run_message_loop(&loop_session, &mut reader, &dispatcher).await
        });

        write_frame(&mut peer_write, Command::Push, b"garbage").await.unwrap();
        assert_eq!(peer_read.next_frame().await.unwrap().command, Command::Heartbeat);

        write_frame(
            &mut peer_write,
            Command::Push,
            br#"{"type":"2","uid":"D1","message":"m","alert":"a","name":"n"}"#,
        )
        .await
        .unwrap();
        assert_eq!(peer_read.next_frame().await.unwrap().command, Command::Heartbeat);

        match rx.recv().await.unwrap() {
            HostTask::Notify(n) => {
                assert_eq!(n.kind, "2");
                assert_eq!(n.uid, "D1");
            }
            other => panic!("unexpected task {other:?}"),
        }

        drop(peer_write);
        drop(peer_read);
        assert_eq!(task.await.unwrap().unwrap(), LoopExit::PeerClosed);
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (session, mut reader, mut peer_read, mut peer_write) = open();
        let (dispatcher, _rx) = dispatcher();
        let loop_session = session.clone();
        let task = tokio::spawn(async move {
            run_message_loop(&loop_session, &mut reader, &dispatcher).await
        });

        write_frame(&mut peer_write, Command::Unknown(77), b"??").await.unwrap();
        assert_eq!(peer_read.next_frame().await.unwrap().command, Command::Heartbeat);
        assert!(!task.is_finished());

        session.disconnect().await;
        assert_eq!(task.await.unwrap().unwrap(), LoopExit::Disconnected);
    }
}
