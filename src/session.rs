//! Session loop.
//!
//! A [`Session`] drives one connection to the access point through its
//! lifetime:
//!
//! ```text
//! Disconnected --handshake--> Announcing --Hello--> Active --> Terminated
//! ```
//!
//! Once active, two tasks share the connection. The receive loop owns the
//! receive half and its cipher. The heartbeat task sends a Probe on a fixed
//! interval. Both write through the same [`PacketWriter`] behind a mutex, so
//! packets never interleave and the send counter advances in wire order.
//!
//! The session terminates when the access point closes the connection, when
//! a packet fails to decrypt, when the access point stays silent for longer
//! than the idle timeout or when the heartbeat cannot write. The heartbeat is
//! always cancelled and joined before [`Session::start`] returns. There is
//! no reconnect at this level: callers restart the session.

use std::{fmt, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::Mutex,
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, ErrorKind, ProtocolError, Result},
    protocol::{
        codec::{Command, Packet, PacketReader, PacketWriter},
        connect::{Announcement, FIRST_HEARTBEAT_SEQ},
        handshake::{Connection, Handshake},
        mercury::{ControlFrame, Request, Response},
    },
    token::{UserToken, UserTokenProvider},
};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Disconnected,
    /// Logged in, announcing the device.
    Announcing,
    /// Announced, heartbeat running.
    Active,
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Announcing => write!(f, "announcing"),
            Self::Active => write!(f, "active"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

type SharedWriter<S> = Arc<Mutex<PacketWriter<WriteHalf<S>>>>;

/// Bound on closing the send half once the session ends.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Session {
    config: Config,
    provider: Box<dyn UserTokenProvider>,
    state: State,
    cancel: Option<CancellationToken>,
    heartbeat: Option<JoinHandle<Result<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(config: Config, provider: impl UserTokenProvider + 'static) -> Self {
        Self {
            config,
            provider: Box::new(provider),
            state: State::default(),
            cancel: None,
            heartbeat: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!("session {} -> {state}", self.state);
            self.state = state;
        }
    }

    /// Connects to the access point and runs the session until it
    /// terminates.
    ///
    /// Returns `Ok(())` when the access point closed the connection.
    ///
    /// # Errors
    ///
    /// * `Unauthenticated` if the access point rejected the login. The user
    ///   token is flushed so that the next start fetches a fresh one.
    /// * `PermissionDenied` if the access point could not prove its identity.
    /// * `DeadlineExceeded` if the handshake or the idle timeout expired.
    /// * `DataLoss` if a packet failed to decrypt.
    pub async fn start(&mut self) -> Result<()> {
        self.set_state(State::Disconnected);

        let token = self.provider.user_token().await?;
        let address = self.config.address();

        let connection = match Handshake::new(&self.config)?.connect(&address).await {
            Ok(connection) => connection,
            Err(e) => {
                if e.kind == ErrorKind::Unauthenticated {
                    self.provider.flush_user_token();
                }
                self.set_state(State::Terminated);
                return Err(e);
            }
        };

        self.run(connection, &token).await
    }

    /// Runs the session over an authenticated connection.
    pub async fn run<S>(&mut self, connection: Connection<S>, token: &UserToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Connection { stream, send, recv } = connection;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half, recv);
        let writer: SharedWriter<S> = Arc::new(Mutex::new(PacketWriter::new(write_half, send)));

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        // Cancels the heartbeat if this future is dropped.
        let _guard = cancel.clone().drop_guard();

        let result = match self.announce(&writer, token).await {
            Ok(announcement) => {
                self.heartbeat = Some(tokio::spawn(heartbeat(
                    Arc::clone(&writer),
                    announcement.clone(),
                    self.config.heartbeat_interval,
                    cancel.clone(),
                )));
                self.set_state(State::Active);

                self.receive(&mut reader, &writer, &announcement, &cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        cancel.cancel();
        let heartbeat = self.join_heartbeat().await;
        let shutdown = async { writer.lock().await.shutdown().await };
        match time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("shutting down connection: {e}"),
            Err(_) => trace!("shutting down connection: timed out"),
        }
        self.cancel = None;
        self.set_state(State::Terminated);

        // The receive loop stops without error when the heartbeat failed.
        result.and(heartbeat)
    }

    /// Stops the session and waits for the heartbeat to finish.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Err(e) = self.join_heartbeat().await {
            debug!("heartbeat ended with: {e}");
        }
        if self.state != State::Disconnected {
            self.set_state(State::Terminated);
        }
    }

    async fn join_heartbeat(&mut self) -> Result<()> {
        match self.heartbeat.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// Confirms the login with an identity request, then announces the
    /// device: subscribe, PUT and Hello, in this order.
    async fn announce<S>(&mut self, writer: &SharedWriter<S>, token: &UserToken) -> Result<Announcement>
    where
        S: AsyncWrite,
    {
        let identity = Request::identity()
            .authenticated(token, &self.config)
            .encode()?;

        self.set_state(State::Announcing);
        let announcement = Announcement::new(&self.config);

        let mut writer = writer.lock().await;
        writer.write_packet(Command::Mercury, &identity).await?;
        debug!("requested user identity");

        writer
            .write_packet(Command::ConnectState, &announcement.subscribe_frame()?)
            .await?;
        writer
            .write_packet(Command::ConnectState, &announcement.put_frame()?)
            .await?;
        writer
            .write_packet(Command::Spirc, &announcement.hello()?)
            .await?;

        info!(
            "announced device {} as \"{}\"",
            announcement.device_id(),
            self.config.device_name
        );
        Ok(announcement)
    }

    async fn receive<S>(
        &mut self,
        reader: &mut PacketReader<ReadHalf<S>>,
        writer: &SharedWriter<S>,
        announcement: &Announcement,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let idle_timeout = self.config.idle_timeout;

        loop {
            let packet = tokio::select! {
                biased;

                () = cancel.cancelled() => return Ok(()),

                packet = next_packet(reader, idle_timeout) => packet?,
            };

            let Some(packet) = packet else {
                info!("connection closed by access point");
                return Ok(());
            };

            self.dispatch(packet, writer, announcement).await?;
        }
    }

    async fn dispatch<S>(
        &mut self,
        packet: Packet,
        writer: &SharedWriter<S>,
        announcement: &Announcement,
    ) -> Result<()>
    where
        S: AsyncWrite,
    {
        match packet.command {
            Command::Spirc => match announcement.probe_to_echo(&packet.payload) {
                Ok(Some(seq_nr)) => {
                    let echo = announcement.probe(seq_nr)?;
                    writer
                        .lock()
                        .await
                        .write_packet(Command::Spirc, &echo)
                        .await?;
                    debug!("echoed probe {seq_nr}");
                }
                Ok(None) => {}
                Err(e) => warn!("ignoring unparsable spirc frame: {e}"),
            },

            Command::Mercury => match Response::decode(&packet.payload) {
                Ok(response) => {
                    debug!(
                        "mercury reply {} status {:?} ({} bytes)",
                        response.uri,
                        response.status_code,
                        response.body.len()
                    );
                    if response.status_code == Some(401) {
                        self.provider.flush_user_token();
                        return Err(ProtocolError::LoginRejected(format!(
                            "{} answered 401",
                            response.uri
                        ))
                        .into());
                    }
                }
                Err(e) => warn!("ignoring unparsable mercury reply: {e}"),
            },

            Command::ConnectState => match ControlFrame::decode(&packet.payload) {
                Ok(frame) => debug!(
                    "connect state {} flags {:#06x} with {} parts",
                    frame.uri,
                    frame.flags,
                    frame.parts.len()
                ),
                Err(e) => warn!("ignoring unparsable control frame: {e}"),
            },

            Command::LoginNotification => debug!("login notification"),

            Command::Unknown(_) => debug!(
                "ignoring {} ({} bytes)",
                packet.command,
                packet.payload.len()
            ),
        }

        Ok(())
    }
}

/// Reads the next packet, bounded by the idle timeout if there is one.
async fn next_packet<R>(
    reader: &mut PacketReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(timeout) => time::timeout(timeout, reader.read_packet())
            .await
            .map_err(|_| {
                Error::from(ProtocolError::Timeout {
                    operation: "receive",
                    timeout,
                })
            })?,
        None => reader.read_packet().await,
    }
}

/// Sends a Probe every `period`, the first one right away.
///
/// Cancels `cancel` when a write fails so that the receive loop stops too.
async fn heartbeat<S>(
    writer: SharedWriter<S>,
    announcement: Announcement,
    period: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncWrite,
{
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seq_nr = FIRST_HEARTBEAT_SEQ;
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(()),

            _ = interval.tick() => {}
        }

        let probe = announcement.probe(seq_nr)?;
        // Blocks for as long as the peer does not read.
        let result = tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(()),

            result = async {
                writer
                    .lock()
                    .await
                    .write_packet(Command::Spirc, &probe)
                    .await
            } => result,
        };
        if let Err(e) = result {
            error!("heartbeat failed: {e}");
            cancel.cancel();
            return Err(e);
        }

        trace!("sent heartbeat {seq_nr}");
        seq_nr = seq_nr.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use protobuf::Message;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::protocol::{
        cipher::SessionCipher,
        handshake::fake::{self, Fault, Outcome},
        mercury::IDENTITY_URI,
        protos::{
            mercury::Header,
            spirc::{Frame, MessageType},
        },
        put_u16_prefixed,
    };

    #[derive(Clone, Default)]
    struct CountingProvider {
        flushes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UserTokenProvider for CountingProvider {
        async fn user_token(&mut self) -> Result<UserToken> {
            UserToken::new("test-token", None)
        }

        fn flush_user_token(&mut self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Access point side of a logged in connection.
    struct Server {
        reader: PacketReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        send: SessionCipher,
    }

    impl Server {
        async fn next(&mut self) -> Packet {
            self.reader.read_packet().await.unwrap().unwrap()
        }

        async fn next_spirc(&mut self) -> Frame {
            let packet = self.next().await;
            assert_eq!(packet.command, Command::Spirc);
            Frame::parse_from_bytes(&packet.payload).unwrap()
        }

        async fn send(&mut self, command: Command, payload: &[u8]) {
            let packet = self.send.seal(command.into(), payload).unwrap();
            self.writer.write_all(&packet).await.unwrap();
        }

        /// Reads the identity request and the announcement.
        async fn expect_announcement(&mut self) {
            let identity = self.next().await;
            assert_eq!(identity.command, Command::Mercury);
            let header_len =
                usize::from(u16::from_be_bytes([identity.payload[0], identity.payload[1]]));
            let header = Header::parse_from_bytes(&identity.payload[2..2 + header_len]).unwrap();
            assert_eq!(header.uri.as_deref(), Some(IDENTITY_URI));
            assert_eq!(header.user_fields[0].value.as_deref(), Some(&b"Bearer test-token"[..]));

            let subscribe = self.next().await;
            assert_eq!(subscribe.command, Command::ConnectState);
            assert_eq!(ControlFrame::decode(&subscribe.payload).unwrap().flags, 0x0000);

            let put = self.next().await;
            assert_eq!(put.command, Command::ConnectState);
            assert_eq!(ControlFrame::decode(&put.payload).unwrap().flags, 0x0003);

            let hello = self.next_spirc().await;
            assert_eq!(
                hello.typ.map(|typ| typ.enum_value_or_default()),
                Some(MessageType::kMessageTypeHello)
            );
        }
    }

    fn config() -> Config {
        let mut config = Config::with_access_point("ap.example.com");
        config.heartbeat_interval = Duration::from_secs(3600);
        config
    }

    async fn logged_in(config: &Config) -> (Connection<DuplexStream>, Server) {
        logged_in_with_buffer(config, 64 * 1024).await
    }

    async fn logged_in_with_buffer(
        config: &Config,
        buffer: usize,
    ) -> (Connection<DuplexStream>, Server) {
        let (client, server) = duplex(buffer);
        let server = tokio::spawn(fake::serve(server, Fault::None));
        let connection = fake::handshake(config).run(client).await.unwrap();

        let Outcome::LoggedIn(server) = server.await.unwrap() else {
            panic!("fake access point did not log in");
        };
        let (read_half, write_half) = tokio::io::split(server.stream);
        (
            connection,
            Server {
                reader: PacketReader::new(read_half, server.recv),
                writer: write_half,
                send: server.send,
            },
        )
    }

    fn spawn_session(
        config: Config,
        provider: CountingProvider,
        connection: Connection<DuplexStream>,
    ) -> JoinHandle<(Session, Result<()>)> {
        tokio::spawn(async move {
            let mut session = Session::new(config, provider);
            let token = UserToken::new("test-token", None).unwrap();
            let result = session.run(connection, &token).await;
            (session, result)
        })
    }

    #[tokio::test]
    async fn announces_then_echoes_probes() {
        let config = config();
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config.clone(), CountingProvider::default(), connection);

        server.expect_announcement().await;

        let heartbeat = server.next_spirc().await;
        assert_eq!(
            heartbeat.typ.map(|typ| typ.enum_value_or_default()),
            Some(MessageType::kMessageTypeProbe)
        );
        assert_eq!(heartbeat.seq_nr, Some(2));
        assert_eq!(heartbeat.ident, Some(config.device_id.to_string()));

        let peer = Announcement::new(&Config::with_access_point("ap.example.com"));
        server.send(Command::Spirc, &peer.probe(77).unwrap()).await;

        let echo = server.next_spirc().await;
        assert_eq!(
            echo.typ.map(|typ| typ.enum_value_or_default()),
            Some(MessageType::kMessageTypeProbe)
        );
        assert_eq!(echo.seq_nr, Some(77));

        drop(server);
        let (session, result) = client.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(session.state(), State::Terminated);
    }

    #[tokio::test]
    async fn heartbeat_counts_up() {
        let mut config = config();
        config.heartbeat_interval = Duration::from_millis(10);
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config, CountingProvider::default(), connection);

        server.expect_announcement().await;
        for expected in 2..5 {
            assert_eq!(server.next_spirc().await.seq_nr, Some(expected));
        }

        // Either side may notice the close first.
        drop(server);
        let (session, _) = client.await.unwrap();
        assert_eq!(session.state(), State::Terminated);
    }

    #[tokio::test]
    async fn unknown_and_unparsable_packets_are_ignored() {
        let config = config();
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config, CountingProvider::default(), connection);

        server.expect_announcement().await;
        let _heartbeat = server.next_spirc().await;

        server.send(Command::Unknown(0x42), b"whatever").await;
        server.send(Command::Spirc, &[0xff, 0xff, 0xff]).await;
        server.send(Command::LoginNotification, b"").await;

        let peer = Announcement::new(&Config::with_access_point("ap.example.com"));
        server.send(Command::Spirc, &peer.probe(9).unwrap()).await;
        assert_eq!(server.next_spirc().await.seq_nr, Some(9));

        drop(server);
        let (_, result) = client.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn bad_tag_terminates() {
        let config = config();
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config, CountingProvider::default(), connection);

        server.expect_announcement().await;

        let mut packet = server.send.seal(Command::Spirc.into(), b"probe").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        server.writer.write_all(&packet).await.unwrap();

        let (session, result) = client.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::DataLoss);
        assert_eq!(session.state(), State::Terminated);
    }

    #[tokio::test]
    async fn bad_tag_terminates_while_heartbeat_is_stuck() {
        let mut config = config();
        config.heartbeat_interval = Duration::from_millis(1);
        let (connection, mut server) = logged_in_with_buffer(&config, 4096).await;
        let client = spawn_session(config, CountingProvider::default(), connection);

        server.expect_announcement().await;

        // Stop reading until the heartbeat fills the pipe and blocks.
        time::sleep(Duration::from_millis(500)).await;

        let mut packet = server.send.seal(Command::Spirc.into(), b"heartbeat").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        server.writer.write_all(&packet).await.unwrap();

        let (session, result) = time::timeout(Duration::from_secs(3), client)
            .await
            .expect("session did not terminate")
            .unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::DataLoss);
        assert_eq!(session.state(), State::Terminated);
        drop(server);
    }

    #[tokio::test]
    async fn silence_exceeds_idle_timeout() {
        let mut config = config();
        config.idle_timeout = Some(Duration::from_millis(50));
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config, CountingProvider::default(), connection);

        server.expect_announcement().await;

        let (_, result) = client.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::DeadlineExceeded);
        drop(server);
    }

    #[tokio::test]
    async fn unauthorized_reply_flushes_token() {
        let config = config();
        let provider = CountingProvider::default();
        let flushes = Arc::clone(&provider.flushes);
        let (connection, mut server) = logged_in(&config).await;
        let client = spawn_session(config, provider, connection);

        server.expect_announcement().await;

        let mut header = Header::new();
        header.uri = Some(IDENTITY_URI.to_string());
        header.status_code = Some(401);
        let mut payload = Vec::new();
        put_u16_prefixed(&mut payload, "header", &header.write_to_bytes().unwrap()).unwrap();
        server.send(Command::Mercury, &payload).await;

        let (_, result) = client.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::Unauthenticated);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        drop(server);
    }

    #[tokio::test]
    async fn stop_without_start() {
        let mut session = Session::new(config(), CountingProvider::default());
        session.stop().await;
        assert_eq!(session.state(), State::Disconnected);
    }
}
