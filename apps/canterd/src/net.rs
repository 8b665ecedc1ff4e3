use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;

use anyhow::Context;
use bytes::Bytes;
use canterio::frame::{FrameReader, FrameWriter};
use canterio::scramble::ScrambleKey;
use canterproto::{ClientCommand, ServerCommand};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Endpoint-local client id, assigned on accept.
pub type ClientId = u32;

/// Connection lifecycle events delivered to the owning director.
///
/// For a given client, `client_connected` strictly precedes any handler
/// invocation and `client_disconnected` strictly follows the last one.
pub trait ServerEvents: Send + Sync + 'static {
    fn client_connected(&self, client_id: ClientId);
    fn client_disconnected(&self, client_id: ClientId);
}

type RawHandler = Arc<dyn Fn(ClientId, Bytes) -> anyhow::Result<()> + Send + Sync>;

enum Outbound {
    Frame(Box<dyn FnOnce() -> (u16, Bytes) + Send>),
    SetKey(ScrambleKey),
    Disconnect,
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
}

/// One command server per endpoint: accepts connections, frames and
/// descrambles inbound traffic, dispatches typed commands, and owns the
/// per-client outbound queue.
///
/// Handlers for one client run strictly one at a time in receive order;
/// handlers for different clients run concurrently.
pub struct CommandServer {
    name: &'static str,
    weak: std::sync::Weak<Self>,
    next_client_id: AtomicU32,
    handlers: RwLock<HashMap<u16, RawHandler>>,
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    events: OnceLock<Arc<dyn ServerEvents>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandServer {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            weak: weak.clone(),
            next_client_id: AtomicU32::new(1),
            handlers: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            events: OnceLock::new(),
            accept_task: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("command server alive")
    }

    /// Wires the director receiving connection events. Must happen before
    /// [`CommandServer::begin_host`].
    pub fn set_event_handler(&self, events: Arc<dyn ServerEvents>) {
        if self.events.set(events).is_err() {
            panic!("event handler already set");
        }
    }

    /// Registers the handler for `T`. A command with no registered handler
    /// is logged and skipped without affecting the connection.
    pub fn register_command_handler<T: ClientCommand>(
        &self,
        handler: impl Fn(ClientId, T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let raw: RawHandler = Arc::new(move |client_id, payload: Bytes| {
            let mut buf = payload;
            let command = T::decode(&mut buf)?;
            handler(client_id, command)
        });

        let previous = self
            .handlers
            .write()
            .unwrap()
            .insert(<T as ClientCommand>::ID, raw);
        assert!(
            previous.is_none(),
            "duplicate handler for command 0x{:04x}",
            <T as ClientCommand>::ID
        );
    }

    /// Binds and starts accepting. Returns the bound address (useful when
    /// hosting on port 0).
    pub async fn begin_host(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("{} bind {addr}", self.name))?;
        let local_addr = listener.local_addr()?;
        info!(server = self.name, addr = %local_addr, "listening");

        let this = self.arc();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.run_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(server = this.name, err = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(local_addr)
    }

    /// Stops accepting and tears down every live connection.
    pub fn end_host(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }

        let clients: Vec<ClientId> = self.clients.lock().unwrap().keys().copied().collect();
        for client_id in clients {
            self.disconnect_client(client_id);
        }
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (rd, wr) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let shutdown = Arc::new(Notify::new());

        self.clients.lock().unwrap().insert(
            client_id,
            ClientHandle {
                tx,
                addr: peer,
                shutdown: shutdown.clone(),
            },
        );

        debug!(server = self.name, client = client_id, peer = %peer, "client connected");
        if let Some(events) = self.events.get() {
            events.client_connected(client_id);
        }

        // Writer task: producers run here, at write time, against the
        // current scramble key.
        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            let mut fw = FrameWriter::new(wr);
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Frame(producer) => {
                        let (command_id, payload) = producer();
                        if fw.write_frame(command_id, &payload).await.is_err() {
                            break;
                        }
                        if fw.flush().await.is_err() {
                            break;
                        }
                    }
                    Outbound::SetKey(key) => fw.set_key(key),
                    Outbound::Disconnect => break,
                }
            }
            // Stop the reader either way.
            writer_shutdown.notify_one();
        });

        let mut fr = FrameReader::new(rd);
        loop {
            tokio::select! {
                frame = fr.read_frame() => {
                    match frame {
                        Ok(Some(frame)) => {
                            if !self.dispatch(client_id, frame.command_id, frame.payload) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(server = self.name, client = client_id, err = %e, "frame error");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        let handle = self.clients.lock().unwrap().remove(&client_id);
        if let Some(handle) = handle {
            // Unblock the writer if it is still draining.
            let _ = handle.tx.send(Outbound::Disconnect);
        }
        let _ = writer.await;

        if let Some(events) = self.events.get() {
            events.client_disconnected(client_id);
        }
        debug!(server = self.name, client = client_id, "client disconnected");
    }

    /// Runs the registered handler. Returns `false` when the client must be
    /// disconnected (handler failure).
    fn dispatch(&self, client_id: ClientId, command_id: u16, payload: Bytes) -> bool {
        let handler = self.handlers.read().unwrap().get(&command_id).cloned();
        let Some(handler) = handler else {
            warn!(
                server = self.name,
                client = client_id,
                command = format_args!("0x{command_id:04x}"),
                "unhandled command"
            );
            return true;
        };

        if let Err(e) = handler(client_id, payload) {
            warn!(
                server = self.name,
                client = client_id,
                command = format_args!("0x{command_id:04x}"),
                err = %e,
                "handler failed; disconnecting client"
            );
            return false;
        }
        true
    }

    /// Enqueues a command for the client. The producer runs when the frame
    /// is actually written, so callers may capture by value and queue from
    /// any thread.
    pub fn queue_command<T: ServerCommand>(
        &self,
        client_id: ClientId,
        producer: impl FnOnce() -> T + Send + 'static,
    ) {
        let clients = self.clients.lock().unwrap();
        let Some(handle) = clients.get(&client_id) else {
            return;
        };
        let _ = handle.tx.send(Outbound::Frame(Box::new(move || {
            let command = producer();
            (<T as ServerCommand>::ID, command.to_payload())
        })));
    }

    /// Rolls the client's outbound scramble key. Ordered with queued
    /// commands: frames queued before keep the old key.
    pub fn set_code(&self, client_id: ClientId, key: [u8; 4]) {
        let clients = self.clients.lock().unwrap();
        if let Some(handle) = clients.get(&client_id) {
            let _ = handle.tx.send(Outbound::SetKey(ScrambleKey::new(key)));
        }
    }

    pub fn disconnect_client(&self, client_id: ClientId) {
        let clients = self.clients.lock().unwrap();
        if let Some(handle) = clients.get(&client_id) {
            let _ = handle.tx.send(Outbound::Disconnect);
            handle.shutdown.notify_one();
        }
    }

    pub fn client_address(&self, client_id: ClientId) -> Option<SocketAddr> {
        self.clients.lock().unwrap().get(&client_id).map(|h| h.addr)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canterproto::race::{AcCmdCRChat, AcCmdCRChatNotify, AcCmdCRLeaveRoom};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct RecordingEvents {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl ServerEvents for RecordingEvents {
        fn client_connected(&self, _client_id: ClientId) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn client_disconnected(&self, _client_id: ClientId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn host(server: &Arc<CommandServer>) -> SocketAddr {
        server
            .begin_host("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dispatches_and_replies() {
        let server = CommandServer::new("test");
        let reply_to = server.clone();
        server.register_command_handler::<AcCmdCRChat>(move |client_id, command| {
            reply_to.queue_command(client_id, move || AcCmdCRChatNotify {
                author: "server".to_string(),
                message: command.message,
                is_system: true,
            });
            Ok(())
        });

        let addr = host(&server).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut fw = FrameWriter::new(wr);
        let mut fr = FrameReader::new(rd);

        let payload = {
            let mut out = bytes::BytesMut::new();
            canterproto::wire::put_string(&mut out, "hello");
            out.freeze()
        };
        fw.write_frame(<AcCmdCRChat as ClientCommand>::ID, &payload)
            .await
            .unwrap();
        fw.flush().await.unwrap();

        let frame = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.command_id, <AcCmdCRChatNotify as ServerCommand>::ID);

        server.end_host();
    }

    #[tokio::test]
    async fn unknown_command_keeps_connection() {
        let server = CommandServer::new("test");
        let reply_to = server.clone();
        server.register_command_handler::<AcCmdCRLeaveRoom>(move |client_id, _| {
            reply_to.queue_command(client_id, || AcCmdCRChatNotify::default());
            Ok(())
        });

        let addr = host(&server).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut fw = FrameWriter::new(wr);
        let mut fr = FrameReader::new(rd);

        // Unregistered id first, then a known command; the reply proves the
        // connection survived the unknown command.
        fw.write_frame(0x3FF0, b"junk").await.unwrap();
        fw.write_frame(<AcCmdCRLeaveRoom as ClientCommand>::ID, b"")
            .await
            .unwrap();
        fw.flush().await.unwrap();

        let frame = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.command_id, <AcCmdCRChatNotify as ServerCommand>::ID);

        server.end_host();
    }

    #[tokio::test]
    async fn handler_error_disconnects_client() {
        let server = CommandServer::new("test");
        server.register_command_handler::<AcCmdCRLeaveRoom>(|_, _| anyhow::bail!("boom"));

        let events = Arc::new(RecordingEvents {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
        });
        server.set_event_handler(events.clone());

        let addr = host(&server).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut fw = FrameWriter::new(wr);
        let mut fr = FrameReader::new(rd);

        fw.write_frame(<AcCmdCRLeaveRoom as ClientCommand>::ID, b"")
            .await
            .unwrap();
        fw.flush().await.unwrap();

        // Server closes; reader sees EOF.
        let got = fr.read_frame().await;
        assert!(matches!(got, Ok(None) | Err(_)));

        tokio::time::timeout(Duration::from_secs(1), async {
            while events.disconnected.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(events.connected.load(Ordering::SeqCst), 1);
        assert_eq!(events.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(server.client_count(), 0);

        server.end_host();
    }

    #[tokio::test]
    async fn key_roll_orders_with_queued_frames() {
        let server = CommandServer::new("test");
        let handler_server = server.clone();
        server.register_command_handler::<AcCmdCRLeaveRoom>(move |client_id, _| {
            handler_server.queue_command(client_id, || AcCmdCRChatNotify {
                author: "srv".to_string(),
                message: "first".to_string(),
                is_system: true,
            });
            handler_server.set_code(client_id, [9, 9, 9, 9]);
            handler_server.queue_command(client_id, || AcCmdCRChatNotify {
                author: "srv".to_string(),
                message: "second".to_string(),
                is_system: true,
            });
            Ok(())
        });

        let addr = host(&server).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut fw = FrameWriter::new(wr);
        let mut fr = FrameReader::new(rd);

        fw.write_frame(<AcCmdCRLeaveRoom as ClientCommand>::ID, b"")
            .await
            .unwrap();
        fw.flush().await.unwrap();

        // The frame queued before the roll still uses the initial key.
        let frame = fr.read_frame().await.unwrap().unwrap();
        let mut buf = frame.payload;
        assert_eq!(canterproto::wire::get_string(&mut buf).unwrap(), "srv");

        // The one after it needs the rolled key.
        fr.set_key(ScrambleKey::new([9, 9, 9, 9]));
        let frame = fr.read_frame().await.unwrap().unwrap();
        let mut buf = frame.payload;
        assert_eq!(canterproto::wire::get_string(&mut buf).unwrap(), "srv");
        assert_eq!(canterproto::wire::get_string(&mut buf).unwrap(), "second");

        server.end_host();
    }

    #[tokio::test]
    async fn malformed_frame_disconnects_client() {
        let server = CommandServer::new("test");
        let addr = host(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncReadExt;
        use tokio::io::AsyncWriteExt;
        // Bit 15 clear: not a valid header.
        stream.write_all(&[0, 0, 0, 0]).await.unwrap();
        stream.flush().await.unwrap();

        let mut sink = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        server.end_host();
    }
}
