//! Persistent connection to poliqarpd with sync/async demultiplexing.
//!
//! One receive loop (a tokio task) is the only reader of the socket. It
//! classifies every inbound line:
//!
//! - `R` lines go to a FIFO consumed by the command currently in flight
//! - `M` lines go to the single registered milestone handler, which is run on
//!   its own task so handler work never blocks the loop
//!
//! Writers go through [`Exchange`], a guard over the write half and the reply
//! FIFO. Holding it is the only way to send a command, so two commands can
//! never interleave their replies.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PoliqarpError, Result};
use crate::ipc::framing::{parse_line, read_line, write_command, LineClass, ServerLine};

/// Callback for the next asynchronous milestone.
pub type MilestoneHandler = Box<dyn FnOnce(ServerLine) + Send + 'static>;

type HandlerSlot = Arc<Mutex<Option<MilestoneHandler>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Established link: write half plus the receiving end of the reply FIFO.
struct Link {
    writer: BoxedWriter,
    replies: mpsc::UnboundedReceiver<Result<ServerLine>>,
}

/// Owner of the socket and the receive loop.
///
/// # Example
///
/// ```ignore
/// let connector = Connector::new();
/// connector.open("127.0.0.1", 4567).await?;
/// let version = connector.send_sync("VERSION").await?;
/// ```
pub struct Connector {
    link: tokio::sync::Mutex<Option<Link>>,
    handler: HandlerSlot,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector {
    pub fn new() -> Self {
        Self {
            link: tokio::sync::Mutex::new(None),
            handler: Arc::new(Mutex::new(None)),
            receive_loop: Mutex::new(None),
        }
    }

    /// Connect to the server. A second call on an open connector is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PoliqarpError::ConnectionFailed` if the server is not
    /// listening.
    pub async fn open(&self, host: &str, port: u16) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            debug!("Connector already open");
            return Ok(());
        }

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(PoliqarpError::ConnectionFailed)?;
        info!("Connected to poliqarpd at {}:{}", host, port);

        let (read_half, write_half) = stream.into_split();
        *link = Some(self.start(BufReader::new(read_half), Box::new(write_half)));
        Ok(())
    }

    /// Use an already established stream instead of a TCP connection.
    ///
    /// Like [`Connector::open`], this does nothing if a link exists.
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut link = self.link.lock().await;
        if link.is_some() {
            debug!("Connector already open");
            return;
        }
        let (read_half, write_half) = tokio::io::split(stream);
        *link = Some(self.start(BufReader::new(read_half), Box::new(write_half)));
    }

    fn start<R>(&self, reader: R, writer: BoxedWriter) -> Link
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(receive_loop(reader, tx, handler));

        if let Ok(mut slot) = self.receive_loop.lock() {
            *slot = Some(task);
        }

        Link {
            writer,
            replies: rx,
        }
    }

    /// Whether the receive loop is still running.
    pub fn is_alive(&self) -> bool {
        self.receive_loop
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Acquire exclusive use of the connection for one command exchange.
    ///
    /// # Errors
    ///
    /// Returns `PoliqarpError::ConnectionClosed` if the connector was never
    /// opened.
    pub async fn exchange(&self) -> Result<Exchange<'_>> {
        let guard = self.link.lock().await;
        if guard.is_none() {
            return Err(PoliqarpError::ConnectionClosed);
        }
        Ok(Exchange {
            link: guard,
            connector: self,
            in_flight: false,
        })
    }

    fn stop_receive_loop(&self) {
        if let Ok(mut slot) = self.receive_loop.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Send one command and return its reply.
    pub async fn send_sync(&self, command: &str) -> Result<String> {
        self.exchange().await?.send_sync(command).await
    }

    /// Send one command whose completion is reported as a milestone.
    pub async fn send_async(&self, command: &str, handler: MilestoneHandler) -> Result<String> {
        self.exchange().await?.send_async(command, handler).await
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop_receive_loop();
    }
}

/// Exclusive access to the connection.
///
/// A multi-line reply (e.g. `GET-RESULTS`) must be read through the same
/// `Exchange` that sent the command: start it with [`Exchange::request`],
/// read the body with [`Exchange::read_line`] and close it with
/// [`Exchange::finish`].
///
/// Dropping an `Exchange` while replies are still owed (a decoding error
/// returned early, or the caller's future was cancelled) poisons the link:
/// the unread lines would otherwise be taken as replies to the next
/// command. Later calls fail with `ConnectionClosed`.
pub struct Exchange<'a> {
    link: MutexGuard<'a, Option<Link>>,
    connector: &'a Connector,
    in_flight: bool,
}

impl Exchange<'_> {
    fn link(&mut self) -> Result<&mut Link> {
        self.link.as_mut().ok_or(PoliqarpError::ConnectionClosed)
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        debug!("send: {}", command);
        self.in_flight = true;
        let link = self.link()?;
        write_command(&mut link.writer, command).await
    }

    /// Write one command line and wait for exactly one reply.
    pub async fn send_sync(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let reply = self.read_reply().await;
        if !matches!(&reply, Err(e) if e.is_transport()) {
            self.in_flight = false;
        }
        reply
    }

    /// Write a command answered by a header reply plus further lines.
    ///
    /// The exchange stays open until [`Exchange::finish`]. An error header
    /// is the whole reply and closes it.
    pub async fn request(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        match self.read_line().await?.into_result() {
            Ok(header) => Ok(header.payload),
            Err(e) => {
                self.in_flight = false;
                Err(e)
            }
        }
    }

    /// Mark the reply of the last command as fully read.
    pub fn finish(mut self) {
        self.in_flight = false;
    }

    /// Write one command whose job finishes with a milestone.
    ///
    /// `handler` is installed before the command is written so a fast
    /// milestone cannot be missed. It replaces any previous handler and is
    /// dropped again if the server rejects the command.
    pub async fn send_async(&mut self, command: &str, handler: MilestoneHandler) -> Result<String> {
        self.set_handler(Some(handler));
        match self.send_sync(command).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.set_handler(None);
                Err(e)
            }
        }
    }

    /// Pop the next synchronous reply; error replies become typed errors.
    pub async fn read_reply(&mut self) -> Result<String> {
        Ok(self.read_line().await?.into_result()?.payload)
    }

    /// Pop the next synchronous reply without interpreting its status.
    pub async fn read_line(&mut self) -> Result<ServerLine> {
        let link = self.link()?;
        match link.replies.recv().await {
            Some(line) => line,
            None => Err(PoliqarpError::ConnectionClosed),
        }
    }

    /// Drop the pending milestone handler, if any.
    pub fn clear_handler(&mut self) {
        self.set_handler(None);
    }

    fn set_handler(&self, handler: Option<MilestoneHandler>) {
        match self.connector.handler.lock() {
            Ok(mut slot) => *slot = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.in_flight || self.link.is_none() {
            return;
        }
        warn!("Reply left unread, closing poliqarpd connection");
        *self.link = None;
        self.connector.stop_receive_loop();
    }
}

/// Read lines until the stream fails, routing each one.
async fn receive_loop<R>(
    mut reader: R,
    replies: mpsc::UnboundedSender<Result<ServerLine>>,
    handler: HandlerSlot,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let raw = match read_line(&mut reader).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("poliqarpd connection lost: {}", e);
                let _ = replies.send(Err(e));
                return;
            }
        };

        let line = match parse_line(&raw) {
            Ok(line) => line,
            Err(e) => {
                // Unclassifiable lines are handed to the waiting caller so
                // the reply count stays aligned with the commands sent.
                warn!("Malformed line from poliqarpd: {}", e);
                if replies.send(Err(e)).is_err() {
                    return;
                }
                continue;
            }
        };

        match line.class {
            LineClass::Reply => {
                debug!("receive sync: {}", line.payload);
                if replies.send(Ok(line)).is_err() {
                    debug!("Reply receiver dropped, stopping receive loop");
                    return;
                }
            }
            LineClass::Milestone => {
                debug!("receive async: {}", line.payload);
                let current = match handler.lock() {
                    Ok(mut slot) => slot.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                match current {
                    Some(callback) => {
                        tokio::spawn(async move { callback(line) });
                    }
                    None => warn!("Milestone with no registered handler: {}", line.payload),
                }
            }
        }
    }
}
