//! Request/response exchange with the controller.
//!
//! A reader task and a writer task own the two halves of the port. At most
//! one command is outstanding at a time: the wire lock is held from the send
//! until the reply (or the timeout) and the first complete frame to arrive
//! after the send is the reply.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{
    codec::{Decoder, Encoder},
    sync::CancellationToken,
};

use tracing as log;

use crate::{
    codec::{AsiCodec, Frame, NAK_MARKER},
    Error, ErrorCode, Result,
};

const WRITE_QUEUE_LEN: usize = 8;
const READ_CHUNK_LEN: usize = 256;

enum Slot {
    Async(oneshot::Sender<Result<Frame>>),
    Blocking(std::sync::mpsc::SyncSender<Result<Frame>>),
}

struct PendingCommand {
    command: String,
    sent: Instant,
    slot: Slot,
}

impl PendingCommand {
    fn resolve(self, result: Result<Frame>) {
        if let Ok(frame) = &result {
            log::trace!(
                "reply to {:?} after {:?}: {frame}",
                self.command,
                self.sent.elapsed()
            );
        }
        // The caller may have given up already. Nothing to do then.
        match self.slot {
            Slot::Async(tx) => {
                let _ = tx.send(result);
            }
            Slot::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
        }
    }
}

struct Inbox {
    buf: BytesMut,
    codec: AsiCodec,
    pending: Option<PendingCommand>,
}

struct Shared {
    inbox: std::sync::Mutex<Inbox>,
    closed: AtomicBool,
}

impl Shared {
    fn inbox(&self) -> std::sync::MutexGuard<'_, Inbox> {
        // No code path panics while holding the lock, but do not let a
        // poisoned lock take the connection down with it.
        self.inbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear stale input and install the slot for the next reply.
    fn arm(&self, command: &str, slot: Slot) {
        let mut inbox = self.inbox();
        if !inbox.buf.is_empty() {
            log::debug!(
                "discarding {} stale bytes before {command:?}",
                inbox.buf.len()
            );
            inbox.buf.clear();
        }
        inbox.pending = Some(PendingCommand {
            command: command.to_string(),
            sent: Instant::now(),
            slot,
        });
    }

    fn disarm(&self) {
        self.inbox().pending = None;
    }

    fn receive(&self, data: &[u8]) {
        let mut guard = self.inbox();
        let inbox = &mut *guard;
        inbox.buf.extend_from_slice(data);
        loop {
            match inbox.codec.decode(&mut inbox.buf) {
                Ok(Some(frame)) => match inbox.pending.take() {
                    Some(pending) => pending.resolve(Ok(frame)),
                    None => log::debug!("dropping unsolicited reply {frame:?}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::error!("decoding reply failed: {e}");
                    inbox.buf.clear();
                    break;
                }
            }
        }
    }

    fn fail_pending(&self, err: Error) {
        if let Some(pending) = self.inbox().pending.take() {
            pending.resolve(Err(err));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("serial connection closed");
        }
        self.fail_pending(Error::Closed);
    }
}

/// Read loop. Returns on EOF, read error or shutdown.
async fn reader<R: AsyncRead + Unpin>(
    mut rdr: R,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut chunk = [0u8; READ_CHUNK_LEN];
    loop {
        let res = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = rdr.read(&mut chunk) => res,
        };
        match res {
            Ok(0) => {
                log::warn!("serial port reached end of stream");
                break;
            }
            Ok(n) => shared.receive(&chunk[..n]),
            Err(e) => {
                log::error!("reading serial port failed: {e}");
                break;
            }
        }
    }
    shared.close();
}

/// Write loop. Returns on write error or shutdown.
async fn writer<W: AsyncWrite + Unpin>(
    mut wtr: W,
    mut rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(buf) = msg else {
            break;
        };
        let res = async {
            wtr.write_all(&buf).await?;
            wtr.flush().await
        }
        .await;
        if let Err(e) = res {
            log::error!("writing serial port failed: {e}");
            shared.fail_pending(Error::Io(e));
            break;
        }
    }
    shared.close();
}

/// Sends one command at a time and waits for its reply.
///
/// Async callers use [CommandEngine::call], synchronous callers outside the
/// runtime use [CommandEngine::call_blocking]. Both paths share the wire lock
/// so they can be mixed freely.
pub struct CommandEngine {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Bytes>,
    wire: tokio::sync::Mutex<()>,
    default_timeout: Duration,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CommandEngine {
    /// Take ownership of an open port and spawn the I/O tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(port: S, default_timeout: Duration, max_buffer_len: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            inbox: std::sync::Mutex::new(Inbox {
                buf: BytesMut::with_capacity(READ_CHUNK_LEN),
                codec: AsiCodec::with_max_len(max_buffer_len),
                pending: None,
            }),
            closed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();
        let (rdr, wtr) = tokio::io::split(port);
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_LEN);

        let read_task = tokio::spawn(reader(rdr, shared.clone(), shutdown.clone()));
        let write_task = tokio::spawn(writer(wtr, rx, shared.clone(), shutdown.clone()));

        Self {
            shared,
            tx,
            wire: tokio::sync::Mutex::new(()),
            default_timeout,
            shutdown,
            tasks: std::sync::Mutex::new(vec![read_task, write_task]),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn encode(&self, command: &str) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(command.len() + 1);
        AsiCodec::new().encode(command, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Send `command` and return the raw reply frame.
    pub async fn call(&self, command: &str) -> Result<Frame> {
        self.call_with_timeout(command, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, command: &str, timeout: Duration) -> Result<Frame> {
        let buf = self.encode(command)?;
        let _wire = self.wire.lock().await;
        self.ensure_open()?;

        log_command(command);
        let (tx, rx) = oneshot::channel();
        self.shared.arm(command, Slot::Async(tx));
        if self.tx.send(buf).await.is_err() {
            self.shared.disarm();
            return Err(Error::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_elapsed) => {
                self.shared.disarm();
                log::warn!("no reply to {command:?} within {timeout:?}");
                Err(Error::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Blocking variant of [CommandEngine::call].
    ///
    /// Panics if called from within an async execution context. Use
    /// `tokio::task::spawn_blocking` or a plain thread.
    pub fn call_blocking(&self, command: &str) -> Result<Frame> {
        self.call_blocking_with_timeout(command, self.default_timeout)
    }

    pub fn call_blocking_with_timeout(&self, command: &str, timeout: Duration) -> Result<Frame> {
        let buf = self.encode(command)?;
        let _wire = self.wire.blocking_lock();
        self.ensure_open()?;

        log_command(command);
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.shared.arm(command, Slot::Blocking(tx));
        if self.tx.blocking_send(buf).is_err() {
            self.shared.disarm();
            return Err(Error::Closed);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::Closed),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.shared.disarm();
                log::warn!("no reply to {command:?} within {timeout:?}");
                Err(Error::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send `command`, require an acknowledgement and return the payload.
    pub async fn request(&self, command: &str) -> Result<String> {
        let frame = self.call(command).await?;
        check_ack(command, frame.as_str())?;
        Ok(frame.payload().to_string())
    }

    pub fn request_blocking(&self, command: &str) -> Result<String> {
        let frame = self.call_blocking(command)?;
        check_ack(command, frame.as_str())?;
        Ok(frame.payload().to_string())
    }

    /// Stop the I/O tasks and release the port.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("serial task failed: {e}");
            }
        }
        self.shared.close();
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Polling commands run several times per second. Keep them out of the
/// debug log.
fn is_chatty(command: &str) -> bool {
    command.starts_with('W') || command.starts_with("RS") || command == "/"
}

fn log_command(command: &str) {
    if is_chatty(command) {
        log::trace!("-> {command}");
    } else {
        log::debug!("-> {command}");
    }
}

/// Classify a reply as acknowledgement or rejection.
///
/// A rejection carries the controller's numeric error code at the end of
/// the reply, which is returned in [Error::NegativeAck].
pub fn check_ack(command: &str, reply: &str) -> Result<()> {
    let reply = reply.trim();
    if reply.is_empty() || !reply.contains(":A") {
        log::warn!("malformed reply to {command:?}: {reply:?}");
        return Err(Error::MalformedResponse {
            command: command.to_string(),
            reply: reply.to_string(),
        });
    }
    if reply.contains(NAK_MARKER) {
        let raw_code = trailing_number(reply);
        let code = raw_code.and_then(|raw| ErrorCode::try_from(raw).ok());
        match code {
            Some(code) => log::error!("{command:?} rejected: {code}"),
            None => log::error!("{command:?} rejected with unrecognized reply {reply:?}"),
        }
        return Err(Error::NegativeAck {
            command: command.to_string(),
            code,
            raw_code,
        });
    }
    if is_chatty(command) {
        log::trace!("{command:?} acknowledged: {reply}");
    } else {
        log::debug!("{command:?} acknowledged: {reply}");
    }
    Ok(())
}

fn trailing_number(reply: &str) -> Option<u32> {
    static TRAILING_DIGITS: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = TRAILING_DIGITS.get_or_init(|| regex::Regex::new(r"\d+$").unwrap());
    re.find(reply).and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn test_check_ack() {
        assert!(check_ack("M X=1", ":A").is_ok());
        assert!(check_ack("W X", ":A 100 200").is_ok());
        assert!(matches!(
            check_ack("W X", ""),
            Err(Error::MalformedResponse { .. })
        ));
        assert!(matches!(
            check_ack("W X", "100 200"),
            Err(Error::MalformedResponse { .. })
        ));
        match check_ack("M X=99999999", ":A :N-4") {
            Err(Error::NegativeAck { code, raw_code, .. }) => {
                assert_eq!(code, Some(ErrorCode::ParameterOutOfRange));
                assert_eq!(raw_code, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
        match check_ack("HALT", ":A :N-21\r\n") {
            Err(Error::NegativeAck { code, .. }) => {
                assert_eq!(code, Some(ErrorCode::SerialCommandHalted));
            }
            other => panic!("unexpected {other:?}"),
        }
        match check_ack("Q", ":A :N-99") {
            Err(Error::NegativeAck { code, raw_code, .. }) => {
                assert_eq!(code, None);
                assert_eq!(raw_code, Some(99));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Answers every line with a fixed reply, after `delay`.
    async fn echo_device(
        device: tokio::io::DuplexStream,
        reply: &'static str,
        delay: Duration,
    ) -> Vec<String> {
        let (rdr, mut wtr) = tokio::io::split(device);
        let mut lines = tokio::io::BufReader::new(rdr).split(b'\r');
        let mut seen = Vec::new();
        while let Ok(Some(line)) = lines.next_segment().await {
            seen.push(String::from_utf8_lossy(&line).into_owned());
            tokio::time::sleep(delay).await;
            if wtr.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_call_returns_reply() {
        let (host, device) = tokio::io::duplex(256);
        let device = tokio::spawn(echo_device(device, ":A 10 20 30\r\n", Duration::ZERO));
        let engine = CommandEngine::start(host, Duration::from_millis(500), 4096);

        let payload = engine.request("W X Y Z").await.unwrap();
        assert_eq!(payload, "10 20 30");
        let frame = engine.call("W X").await.unwrap();
        assert_eq!(frame.as_str(), ":A 10 20 30");

        engine.close().await;
        assert!(!engine.is_open());
        assert!(matches!(engine.call("W X").await, Err(Error::NotOpen)));
        let seen = device.await.unwrap();
        assert_eq!(seen, vec!["W X Y Z", "W X"]);
    }

    #[tokio::test]
    async fn test_timeout_then_recovers() {
        let (host, device) = tokio::io::duplex(256);
        let _device = tokio::spawn(echo_device(device, ":A\r\n", Duration::from_millis(150)));
        let engine = CommandEngine::start(host, Duration::from_millis(500), 4096);

        let err = engine
            .call_with_timeout("HALT", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));

        // The late reply to HALT must not be taken as the reply to the next
        // command. It arrives while nothing is pending and is dropped.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let frame = engine.call("Z").await.unwrap();
        assert_eq!(frame.as_str(), ":A");
    }

    #[tokio::test]
    async fn test_nak_is_returned() {
        let (host, device) = tokio::io::duplex(256);
        let _device = tokio::spawn(echo_device(device, ":A :N-1\r\n", Duration::ZERO));
        let engine = CommandEngine::start(host, Duration::from_millis(500), 4096);
        let err = engine.request("FOO").await.unwrap_err();
        assert!(matches!(
            err,
            Error::NegativeAck {
                code: Some(ErrorCode::UnknownCommand),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_device_hangup_fails_pending() {
        let (host, device) = tokio::io::duplex(256);
        let engine = CommandEngine::start(host, Duration::from_secs(5), 4096);
        let hangup = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(device);
        });
        let err = engine.call("W X").await.unwrap_err();
        assert!(matches!(err, Error::Closed | Error::Io(_)), "{err:?}");
        hangup.await.unwrap();
        assert!(!engine.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call() {
        let (host, device) = tokio::io::duplex(256);
        let _device = tokio::spawn(echo_device(device, ":A 1 2 3\r\n", Duration::ZERO));
        let engine = Arc::new(CommandEngine::start(host, Duration::from_millis(500), 4096));

        let e2 = engine.clone();
        let payload = tokio::task::spawn_blocking(move || e2.request_blocking("W X Y Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "1 2 3");

        // mixing with the async path
        assert_eq!(engine.request("W X").await.unwrap(), "1 2 3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_timeout_disarms() {
        let (host, device) = tokio::io::duplex(256);
        let _device = tokio::spawn(echo_device(device, ":A\r\n", Duration::from_millis(150)));
        let engine = Arc::new(CommandEngine::start(host, Duration::from_millis(500), 4096));

        let e2 = engine.clone();
        let err = tokio::task::spawn_blocking(move || {
            e2.call_blocking_with_timeout("HALT", Duration::from_millis(20))
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { ref command, .. } if command == "HALT"));

        // the late HALT reply is dropped, the next command gets its own
        tokio::time::sleep(Duration::from_millis(200)).await;
        let e2 = engine.clone();
        let frame = tokio::task::spawn_blocking(move || e2.call_blocking("Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_str(), ":A");
        assert!(engine.is_open());
    }

    #[test]
    fn test_command_with_terminator_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (host, _device) = tokio::io::duplex(256);
            let engine = CommandEngine::start(host, Duration::from_millis(100), 4096);
            assert!(matches!(
                engine.call("M X=1\rZ").await,
                Err(Error::TerminatorInCommand(_))
            ));
        });
    }
}
