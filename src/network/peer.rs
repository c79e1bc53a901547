//! A single peer connection: dialing, handshake and message framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::p2p::address::Address as P2pAddress;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage, MAX_MSG_SIZE};
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{NetworkError, NetworkResult};
use crate::network::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, READ_TIMEOUT};
use crate::types::{PeerId, PeerInfo};

/// Outbound connection hook. The default dials TCP directly; callers can
/// supply their own to route through a proxy such as Tor.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(address).await
    }
}

#[derive(Debug, Default, Clone)]
struct RemoteInfo {
    version: Option<u32>,
    services: Option<ServiceFlags>,
    user_agent: Option<String>,
    best_height: Option<i32>,
}

/// One connected peer. Reads run on the owning task via [`MessageReader`];
/// writes are serialized through an internal mutex so any task may send.
pub struct Peer {
    id: PeerId,
    address: SocketAddr,
    magic: Magic,
    writer: Mutex<OwnedWriteHalf>,
    remote: std::sync::Mutex<RemoteInfo>,
    connected: AtomicBool,
    /// Bloom-filter false positives since the last filter reload.
    false_positives: AtomicU32,
}

/// Read half of a peer connection, held by the peer's read-loop task.
pub struct MessageReader {
    reader: BufReader<OwnedReadHalf>,
    magic: Magic,
}

impl MessageReader {
    /// Read one length-delimited message, verifying magic and checksum.
    /// Waits at most [`READ_TIMEOUT`]; `Ok(None)` means the timer fired
    /// without any bytes arriving.
    pub async fn read_message(&mut self) -> NetworkResult<Option<NetworkMessage>> {
        let mut header = [0u8; 24];
        match timeout(READ_TIMEOUT, self.reader.read_exact(&mut header)).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NetworkError::PeerDisconnected)
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        if header[..4] != self.magic.to_bytes() {
            return Err(NetworkError::Protocol("bad network magic".into()));
        }
        let payload_len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        if payload_len as usize > MAX_MSG_SIZE {
            return Err(NetworkError::Protocol(format!("oversized message: {}", payload_len)));
        }

        let mut buf = vec![0u8; 24 + payload_len as usize];
        buf[..24].copy_from_slice(&header);
        match timeout(READ_TIMEOUT, self.reader.read_exact(&mut buf[24..])).await {
            Err(_) => return Err(NetworkError::ReadTimeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NetworkError::PeerDisconnected)
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let raw: RawNetworkMessage = encode::deserialize(&buf)?;
        Ok(Some(raw.payload().clone()))
    }
}

impl Peer {
    /// Dial and return the peer with its read half. The connection is not
    /// usable until [`Peer::handshake`] completes.
    pub async fn connect(
        id: PeerId,
        address: SocketAddr,
        magic: Magic,
        dialer: &dyn Dialer,
    ) -> NetworkResult<(Self, MessageReader)> {
        let stream = timeout(CONNECT_TIMEOUT, dialer.dial(address))
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("{}: connect timeout", address)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let peer = Self {
            id,
            address,
            magic,
            writer: Mutex::new(write_half),
            remote: std::sync::Mutex::new(RemoteInfo::default()),
            connected: AtomicBool::new(false),
            false_positives: AtomicU32::new(0),
        };
        let reader = MessageReader {
            reader: BufReader::new(read_half),
            magic,
        };
        tracing::debug!(peer = %id, %address, "Connected");
        Ok((peer, reader))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Serialize and send one message.
    pub async fn send(&self, message: NetworkMessage) -> NetworkResult<()> {
        let raw = RawNetworkMessage::new(self.magic, message);
        let bytes = encode::serialize(&raw);
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        tracing::trace!(peer = %self.id, cmd = %raw.command(), "Sent message");
        Ok(())
    }

    /// Run the version handshake: send version, read the remote's version
    /// and verack, then acknowledge. The remote must advertise NODE_BLOOM
    /// or the wallet cannot use it.
    pub async fn handshake(
        &self,
        reader: &mut MessageReader,
        start_height: i32,
        user_agent: &str,
    ) -> NetworkResult<()> {
        self.send(self.version_message(start_height, user_agent)).await?;
        tracing::debug!(peer = %self.id, "Sent version message");

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let mut version_received = false;
        let mut verack_received = false;
        while !(version_received && verack_received) {
            let message = match tokio::time::timeout_at(deadline, reader.read_message()).await {
                Err(_) => return Err(NetworkError::HandshakeFailed("timed out".into())),
                Ok(read) => match read? {
                    Some(message) => message,
                    None => continue,
                },
            };
            match message {
                NetworkMessage::Version(version) => {
                    if !version.services.has(ServiceFlags::BLOOM) {
                        return Err(NetworkError::MissingBloomService);
                    }
                    tracing::info!(
                        peer = %self.id,
                        agent = %version.user_agent,
                        height = version.start_height,
                        "Peer version received"
                    );
                    let mut remote = self.remote.lock().expect("peer info mutex");
                    remote.version = Some(version.version);
                    remote.services = Some(version.services);
                    remote.user_agent = Some(version.user_agent.clone());
                    remote.best_height = Some(version.start_height);
                    version_received = true;
                }
                NetworkMessage::Verack => {
                    verack_received = true;
                }
                // Anything else before the handshake completes is noise.
                other => {
                    tracing::trace!(peer = %self.id, cmd = %other.cmd(), "Ignoring pre-handshake message");
                }
            }
        }
        self.send(NetworkMessage::Verack).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn version_message(&self, start_height: i32, user_agent: &str) -> NetworkMessage {
        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let mut version = VersionMessage::new(
            // The wallet advertises no services of its own.
            ServiceFlags::NONE,
            timestamp,
            P2pAddress::new(&self.address, ServiceFlags::NONE),
            P2pAddress::new(&self.address, ServiceFlags::NONE),
            rand::random::<u64>(),
            user_agent.to_string(),
            start_height,
        );
        version.version = PROTOCOL_VERSION;
        // Non-relaying client: only filtered inventory may be announced.
        version.relay = false;
        NetworkMessage::Version(version)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Record a bloom-filter false positive; returns the running count.
    pub fn record_false_positive(&self) -> u32 {
        self.false_positives.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_false_positives(&self) {
        self.false_positives.store(0, Ordering::SeqCst);
    }

    pub fn best_height(&self) -> Option<i32> {
        self.remote.lock().expect("peer info mutex").best_height
    }

    pub fn info(&self, download_peer: bool) -> PeerInfo {
        let remote = self.remote.lock().expect("peer info mutex").clone();
        PeerInfo {
            address: self.address,
            connected: self.is_connected(),
            version: remote.version,
            services: remote.services.map(|s| s.to_u64()),
            user_agent: remote.user_agent,
            best_height: remote.best_height,
            download_peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::p2p::message_blockdata::Inventory;
    use bitcoin::Network;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Peer, MessageReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let (peer, reader) = Peer::connect(
            PeerId(1),
            address,
            Magic::from(Network::Regtest),
            &TcpDialer,
        )
        .await
        .unwrap();
        let remote = accept.await.unwrap();
        (peer, reader, remote)
    }

    #[tokio::test]
    async fn send_frames_round_trip() {
        let (peer, _reader, mut remote) = connected_pair().await;
        peer.send(NetworkMessage::Ping(77)).await.unwrap();

        let mut buf = vec![0u8; 24 + 8];
        remote.read_exact(&mut buf).await.unwrap();
        let raw: RawNetworkMessage = encode::deserialize(&buf).unwrap();
        assert!(matches!(raw.payload(), NetworkMessage::Ping(77)));
    }

    #[tokio::test]
    async fn reader_decodes_and_checks_magic() {
        let (_peer, mut reader, mut remote) = connected_pair().await;

        let good = RawNetworkMessage::new(
            Magic::from(Network::Regtest),
            NetworkMessage::Inv(vec![Inventory::Error]),
        );
        remote.write_all(&encode::serialize(&good)).await.unwrap();
        let message = reader.read_message().await.unwrap().unwrap();
        assert!(matches!(message, NetworkMessage::Inv(_)));

        let bad =
            RawNetworkMessage::new(Magic::from(Network::Bitcoin), NetworkMessage::Ping(1));
        remote.write_all(&encode::serialize(&bad)).await.unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(NetworkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn handshake_requires_bloom_service() {
        let (peer, mut reader, mut remote) = connected_pair().await;
        let magic = Magic::from(Network::Regtest);

        let handshake = tokio::spawn(async move {
            let result = peer.handshake(&mut reader, 0, "/test:0.1/").await;
            (peer, result)
        });

        // Swallow the wallet's version message.
        let mut header = [0u8; 24];
        remote.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let mut payload = vec![0u8; len as usize];
        remote.read_exact(&mut payload).await.unwrap();

        // Respond without NODE_BLOOM.
        let version = VersionMessage::new(
            ServiceFlags::NETWORK,
            0,
            P2pAddress::new(&remote.local_addr().unwrap(), ServiceFlags::NONE),
            P2pAddress::new(&remote.local_addr().unwrap(), ServiceFlags::NONE),
            1,
            "/noblooms:1.0/".into(),
            0,
        );
        let raw = RawNetworkMessage::new(magic, NetworkMessage::Version(version));
        remote.write_all(&encode::serialize(&raw)).await.unwrap();

        let (_peer, result) = handshake.await.unwrap();
        assert!(matches!(result, Err(NetworkError::MissingBloomService)));
    }

    #[tokio::test]
    async fn handshake_completes_with_bloom_peer() {
        let (peer, mut reader, mut remote) = connected_pair().await;
        let magic = Magic::from(Network::Regtest);

        let handshake = tokio::spawn(async move {
            let result = peer.handshake(&mut reader, 5, "/test:0.1/").await;
            (peer, result)
        });

        let mut header = [0u8; 24];
        remote.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let mut payload = vec![0u8; len as usize];
        remote.read_exact(&mut payload).await.unwrap();
        let mut full = header.to_vec();
        full.extend_from_slice(&payload);
        let raw: RawNetworkMessage = encode::deserialize(&full).unwrap();
        let our_version = match raw.payload() {
            NetworkMessage::Version(v) => v.clone(),
            other => panic!("expected version, got {:?}", other.cmd()),
        };
        assert_eq!(our_version.version, PROTOCOL_VERSION);
        assert!(!our_version.relay);
        assert_eq!(our_version.services, ServiceFlags::NONE);
        assert_eq!(our_version.start_height, 5);

        let version = VersionMessage::new(
            ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            0,
            P2pAddress::new(&remote.local_addr().unwrap(), ServiceFlags::NONE),
            P2pAddress::new(&remote.local_addr().unwrap(), ServiceFlags::NONE),
            1,
            "/blooms:1.0/".into(),
            100,
        );
        remote
            .write_all(&encode::serialize(&RawNetworkMessage::new(
                magic,
                NetworkMessage::Version(version),
            )))
            .await
            .unwrap();
        remote
            .write_all(&encode::serialize(&RawNetworkMessage::new(magic, NetworkMessage::Verack)))
            .await
            .unwrap();

        let (peer, result) = handshake.await.unwrap();
        result.unwrap();
        assert!(peer.is_connected());
        assert_eq!(peer.best_height(), Some(100));
        let info = peer.info(true);
        assert_eq!(info.user_agent.as_deref(), Some("/blooms:1.0/"));
        assert!(info.download_peer);
    }
}
