//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication against per-user authorised-keys files
//! - Session channels (shell, exec) placed in per-session containers
//! - PTY allocation and window-change propagation
//! - Session deadlines and exit-status delivery

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator};
use crate::config::GatewayConfig;
use crate::container::{ExitStatus, InteractiveStreams, ManagerSpawner, TermSize};

const SHUTDOWN_MESSAGE: &[u8] = b"exiting: server shutdown\n";

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub authenticator: Authenticator,
    pub spawner: Arc<dyn ManagerSpawner>,

    /// Cancelled when the process is shutting down.
    pub shutdown: CancellationToken,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Username from the most recent auth attempt; authoritative once
    /// `authed` is set.
    username: Option<String>,
    authed: bool,

    /// Fingerprint granted at auth time (the `pubkey-fp` extension).
    pubkey_fp: Option<String>,

    /// The one serviced session channel. Later session channels are
    /// accepted and closed immediately.
    session_channel: Option<ChannelId>,

    /// Recorded by the first pty-req.
    pty_size: Option<TermSize>,

    /// Set once shell/exec has started the container task.
    running: bool,

    /// Client data -> task stdin. Dropped on EOF.
    stdin_tx: Option<mpsc::Sender<Bytes>>,

    /// Window-change events -> task resize.
    resize_tx: Option<mpsc::Sender<TermSize>>,

    /// Collapses the session (and its container) when triggered.
    session_cancel: Option<CancellationToken>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            username: None,
            authed: false,
            pubkey_fp: None,
            session_channel: None,
            pty_size: None,
            running: false,
            stdin_tx: None,
            resize_tx: None,
            session_cancel: None,
        }
    }

    fn is_session_channel(&self, channel_id: ChannelId) -> bool {
        self.session_channel == Some(channel_id)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Connection gone; collapse whatever session it was running.
        if let Some(cancel) = &self.session_cancel {
            cancel.cancel();
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        let username = self.username.as_deref().unwrap_or("unknown");
        Ok(Some(format!("User {} from {}\n", username, self.peer_addr)))
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    /// First phase: the client asks whether this key would be acceptable.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{user}' from {}", self.peer_addr);
        self.username = Some(user.to_string());

        match self.server.authenticator.authenticate(user, public_key) {
            Ok(_) => Ok(Auth::Accept),
            Err(e) => {
                log_auth_error(&e);
                // Keep publickey enabled so the client can try another key.
                Ok(Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
                    partial_success: false,
                })
            }
        }
    }

    /// Second phase: signature verified by russh; re-read the key file so
    /// edits between the two phases are honoured.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());

        match self.server.authenticator.authenticate(user, public_key) {
            Ok(permissions) => {
                self.authed = true;
                self.pubkey_fp = permissions.extensions.get("pubkey-fp").cloned();
                Ok(Auth::Accept)
            }
            Err(e) => {
                log_auth_error(&e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_channel.is_some() {
            // One container task per connection; extra session channels are
            // accepted and closed straight away.
            debug!("Closing additional session channel {:?}", channel.id());
            channel.close().await?;
            return Ok(true);
        }

        debug!("Session channel opened: {:?}", channel.id());
        self.session_channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel_id) || self.running {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        if self.pty_size.is_some() {
            debug!("Rejecting pty-req: pty already initialised");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        debug!("PTY request: term={term}, cols={col_width}, rows={row_height}");
        self.pty_size = Some(TermSize {
            columns: col_width,
            rows: row_height,
        });
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel_id) {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let size = TermSize {
            columns: col_width,
            rows: row_height,
        };
        debug!("Window change: cols={col_width}, rows={row_height}");

        match &self.resize_tx {
            Some(tx) => {
                // Bounded feed; resizes are refreshable, so a dropped one is
                // superseded by the next.
                if tx.try_send(size).is_err() {
                    debug!("Resize feed full, dropping window change");
                }
            }
            // Not running yet; the task will start with the latest size.
            None => self.pty_size = Some(size),
        }

        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {channel_id:?}");

        if !self.is_session_channel(channel_id) || self.running {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        self.start_session(channel_id, None, session).await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel_id) || self.running {
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let command = match std::str::from_utf8(data) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejecting exec request with non-UTF-8 command: {e}");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        info!("Exec request on channel {channel_id:?}: {command}");

        self.start_session(channel_id, Some(split_command(command)), session)
            .await
    }

    /// Data from the client becomes the task's stdin.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.is_session_channel(channel_id) {
            if let Some(tx) = &self.stdin_tx {
                let _ = tx.send(Bytes::copy_from_slice(data)).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {channel_id:?}");
        if self.is_session_channel(channel_id) {
            // Dropping the sender delivers EOF to the task's stdin.
            self.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {channel_id:?}");
        if self.is_session_channel(channel_id) {
            if let Some(cancel) = &self.session_cancel {
                cancel.cancel();
            }
        }
        Ok(())
    }
}

impl ConnectionHandler {
    /// Resolve the session parameters, wire the channel's streams to a fresh
    /// container task, and hand the rest of the session to `supervise`.
    ///
    /// `command` is `None` for a `shell` request, which runs the configured
    /// argv.
    async fn start_session(
        &mut self,
        channel_id: ChannelId,
        command: Option<Vec<String>>,
        session: &mut Session,
    ) -> Result<()> {
        let username = self
            .username
            .clone()
            .filter(|_| self.authed)
            .ok_or_else(|| anyhow!("Not authenticated"))?;

        let cfg = self.server.config.session_for(&username);
        let command = command.unwrap_or_else(|| cfg.argv.clone());

        if let Some(fp) = &self.pubkey_fp {
            debug!("Starting session for {username} ({fp})");
        }
        info!("Running {command:?} for {username} in {}", cfg.image);

        let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(32);
        let (resize_tx, resize_rx) = mpsc::channel::<TermSize>(1);

        let handle = session.handle();
        let (stdout, stdout_done) = client_writer(handle.clone(), channel_id, None);
        let (stderr, stderr_done) = client_writer(handle.clone(), channel_id, Some(1));

        let streams = InteractiveStreams {
            stdin: client_reader(stdin_rx),
            stdout,
            stderr,
            initial_size: self.pty_size,
            updates: resize_rx,
        };

        let cancel = self.server.shutdown.child_token();

        let exits = match self
            .server
            .spawner
            .spawn(&cfg.image, command, streams, cancel.clone())
            .await
        {
            Ok(exits) => exits,
            Err(e) => {
                warn!("Error spawning task for {username}: {e:#}");
                let msg = format!("spawn failed: {e:#}\n");
                session.data(channel_id, CryptoVec::from_slice(msg.as_bytes()))?;
                session.channel_failure(channel_id)?;
                session.close(channel_id)?;
                return Ok(());
            }
        };

        session.channel_success(channel_id)?;

        self.stdin_tx = Some(stdin_tx);
        self.resize_tx = Some(resize_tx);
        self.session_cancel = Some(cancel.clone());
        self.running = true;

        let shutdown = self.server.shutdown.clone();
        let max_duration = cfg.max_session();
        tokio::spawn(supervise(
            handle,
            channel_id,
            exits,
            cancel,
            shutdown,
            max_duration,
            stdout_done,
            stderr_done,
        ));

        Ok(())
    }
}

/// Wait for whichever terminal event comes first (natural task exit, the
/// session deadline, or server shutdown) and close the channel exactly once
/// with the container already torn down.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    handle: russh::server::Handle,
    channel_id: ChannelId,
    mut exits: mpsc::Receiver<ExitStatus>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    max_duration: Duration,
    stdout_done: JoinHandle<()>,
    stderr_done: JoinHandle<()>,
) {
    tokio::select! {
        maybe_status = exits.recv() => {
            if let Some(status) = maybe_status {
                // The spawner shuts stdout down before emitting, so once
                // the forwarders finish every output byte is on the wire.
                let _ = stdout_done.await;
                let _ = stderr_done.await;

                if let Some(error) = &status.error {
                    warn!("Task ended abnormally: {error}");
                }
                if handle
                    .exit_status_request(channel_id, status.code)
                    .await
                    .is_err()
                {
                    debug!("Could not deliver exit status {}", status.code);
                }
            }
        }
        _ = tokio::time::sleep(max_duration) => {
            info!("Session deadline of {max_duration:?} reached");
            let msg = deadline_message(max_duration);
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(msg.as_bytes()))
                .await;
            cancel.cancel();
        }
        _ = shutdown.cancelled() => {
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(SHUTDOWN_MESSAGE))
                .await;
            cancel.cancel();
        }
    }

    // The spawner closes the exit feed after teardown; draining it here
    // means the container is gone before the channel closes.
    while exits.recv().await.is_some() {}

    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

fn deadline_message(max_duration: Duration) -> String {
    format!("exiting: session open longer than {max_duration:?}\n")
}

/// Split an exec command on single spaces. Quoted arguments are not
/// honoured; consecutive spaces produce empty fields.
fn split_command(raw: &str) -> Vec<String> {
    raw.split(' ').map(str::to_string).collect()
}

/// Client-to-task byte stream, fed by the channel's data callback.
fn client_reader(rx: mpsc::Receiver<Bytes>) -> Box<dyn AsyncRead + Send + Unpin> {
    let stream = ReceiverStream::new(rx).map(Ok::<_, io::Error>);
    Box::new(StreamReader::new(stream))
}

/// Task-to-client byte stream. Bytes written to the returned writer are
/// forwarded to the channel as data, or extended data when `ext` is set.
/// The join handle resolves once every byte has been handed to the channel.
fn client_writer(
    handle: russh::server::Handle,
    channel_id: ChannelId,
    ext: Option<u32>,
) -> (Box<dyn AsyncWrite + Send + Unpin>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(32);

    let forward = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            let data = CryptoVec::from_slice(&buf);
            let sent = match ext {
                Some(code) => handle.extended_data(channel_id, code, data).await,
                None => handle.data(channel_id, data).await,
            };
            if sent.is_err() {
                debug!("Client channel closed, dropping task output");
                break;
            }
        }
    });

    let sink =
        PollSender::new(tx).sink_map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
    (Box::new(SinkWriter::new(CopyToBytes::new(sink))), forward)
}

fn log_auth_error(error: &AuthError) {
    match error {
        AuthError::Malformed(_) => warn!("Denying authentication: {error}"),
        _ => info!("Denying authentication: {error}"),
    }
}

/// Run the SSH server until the listener fails or shutdown is triggered.
pub async fn run_server(state: Arc<ServerState>) -> Result<()> {
    let key = load_or_generate_host_key(&state.config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        ..Default::default()
    });

    let addr = state.config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = state.shutdown.cancelled() => {
                info!("Shutting down listener");
                return Ok(());
            }
        };

        let state = state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {e}");
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {e}");
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let key_bytes = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, key_bytes.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("echo hi"), vec!["echo", "hi"]);
        assert_eq!(split_command("ls"), vec!["ls"]);
        // Splitting is on single spaces only; quoting is not honoured and
        // runs of spaces produce empty fields.
        assert_eq!(split_command("echo  hi"), vec!["echo", "", "hi"]);
        assert_eq!(split_command("echo 'a b'"), vec!["echo", "'a", "b'"]);
    }

    #[test]
    fn test_deadline_message() {
        assert_eq!(
            deadline_message(Duration::from_secs(2)),
            "exiting: session open longer than 2s\n"
        );
    }

    #[tokio::test]
    async fn test_client_reader_yields_channel_data() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = client_reader(rx);

        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn test_client_reader_ends_on_sender_drop() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let mut reader = client_reader(rx);
        drop(tx);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
