// WEFT v0.6.2 - Encrypted P2P Mesh Messenger

use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};

// ============================================================================
// CONSTANTS
// ============================================================================

const RSA_BITS: usize = 2048;
const OAEP_OVERHEAD: usize = 2 * 32 + 2; // SHA-256 OAEP: k - 2*hLen - 2

const DELIMITER: char = '|';
const KEY_EXCHANGE_PREFIX: &str = "KEY_EXCHANGE:";
const GOSSIP_PREFIX: &str = "GOSSIP_PEERS:";
const DISCOVER_CMD: &str = "DISCOVER";
const DISCOVER_RESPONSE_CMD: &str = "DISCOVER_RESPONSE";

const DEFAULT_MULTICAST_ADDR: &str = "239.255.255.250:9999";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const GOSSIP_INTERVAL: Duration = Duration::from_secs(10);
const DISCOVERY_READ_TIMEOUT: Duration = Duration::from_secs(1);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const SEND_QUEUE_CAPACITY: usize = 10;
const EVENT_QUEUE_CAPACITY: usize = 64;
const UI_QUEUE_CAPACITY: usize = 100;
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const CHUNK_SIZE: usize = 8192;
const CHUNK_PACING: Duration = Duration::from_millis(10);

const MAX_VOICE_SECS: u64 = 60;
const VOICE_SAMPLE_RATE: u32 = 44100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug)]
pub enum WeftError {
    BindFailed(io::Error),
    DialFailed(String),
    DuplicatePeer(String),
    FrameParse(String),
    KeyLoadFailed(String),
    NoPeerKey(String),
    SenderKeyMismatch(String),
    DecryptFailed(String),
    SignatureInvalid(String),
    Crypto(String),
    ChannelFull(String),
    ConnectionLost(String),
    IntegrityMismatch { file_id: String, chunk_index: usize },
    TransferFailed(String),
    Serialization(String),
    Io(io::Error),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed(e) => write!(f, "bind failed: {}", e),
            Self::DialFailed(s) => write!(f, "dial failed: {}", s),
            Self::DuplicatePeer(s) => write!(f, "peer {} already connected", s),
            Self::FrameParse(s) => write!(f, "invalid frame: {}", s),
            Self::KeyLoadFailed(s) => write!(f, "key load failed: {}", s),
            Self::NoPeerKey(s) => write!(f, "no public key for peer: {}", s),
            Self::SenderKeyMismatch(s) => {
                write!(f, "sender key does not match stored key for {}", s)
            }
            Self::DecryptFailed(s) => write!(f, "decryption failed: {}", s),
            Self::SignatureInvalid(s) => write!(f, "signature verification failed: {}", s),
            Self::Crypto(s) => write!(f, "crypto error: {}", s),
            Self::ChannelFull(s) => write!(f, "send queue full for {}", s),
            Self::ConnectionLost(s) => write!(f, "connection lost: {}", s),
            Self::IntegrityMismatch { file_id, chunk_index } => {
                write!(f, "checksum mismatch for chunk {} of transfer {}", chunk_index, file_id)
            }
            Self::TransferFailed(s) => write!(f, "transfer failed: {}", s),
            Self::Serialization(s) => write!(f, "serialization error: {}", s),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl From<io::Error> for WeftError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

// ============================================================================
// WIRE FRAMING
// ============================================================================
// One message per line: <sender_id>|<payload>\n. The payload may contain
// further delimiter bytes but never a newline; readers split on the first
// delimiter only.

fn encode_frame(sender_id: &str, payload: &str) -> Result<String> {
    if payload.contains('\n') {
        return Err(WeftError::FrameParse("payload contains newline".into()));
    }
    Ok(format!("{}{}{}", sender_id, DELIMITER, payload))
}

fn parse_frame(line: &str) -> Result<(String, String)> {
    match line.split_once(DELIMITER) {
        Some((sender, payload)) => Ok((sender.to_string(), payload.to_string())),
        None => Err(WeftError::FrameParse(format!("missing delimiter: {:.80}", line))),
    }
}

fn encode_discovery(command: &str, node_id: &str) -> String {
    format!("{}{}{}", command, DELIMITER, node_id)
}

fn parse_discovery(datagram: &str) -> Option<(&str, &str)> {
    datagram.split_once(DELIMITER)
}

fn encode_gossip(known: &HashSet<String>, self_id: &str) -> Option<String> {
    let ids: Vec<&str> = known
        .iter()
        .filter(|id| id.as_str() != self_id && !id.is_empty())
        .map(|id| id.as_str())
        .collect();
    if ids.is_empty() {
        return None;
    }
    Some(format!("{}{}", GOSSIP_PREFIX, ids.join(",")))
}

fn parse_gossip(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

// ============================================================================
// CRYPTO ENGINE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub ciphertext: String,
    pub signature: String,
    pub sender_pubkey: String,
    pub timestamp: i64,
    pub message_type: String,
}

pub struct CryptoEngine {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_pem: String,
    peer_keys: RwLock<HashMap<String, RsaPublicKey>>,
}

impl CryptoEngine {
    /// Loads the node keypair from `keys_dir`, generating and persisting a
    /// fresh one only when `private.pem` does not exist. Any other failure
    /// is fatal for startup.
    pub fn new(keys_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(keys_dir)
            .map_err(|e| WeftError::KeyLoadFailed(format!("create {}: {}", keys_dir.display(), e)))?;
        set_mode(keys_dir, 0o700)
            .map_err(|e| WeftError::KeyLoadFailed(format!("chmod {}: {}", keys_dir.display(), e)))?;

        let private_path = keys_dir.join("private.pem");
        let public_path = keys_dir.join("public.pem");

        let (private_key, public_key) = if private_path.exists() {
            Self::load_keys(&private_path, &public_path)?
        } else {
            let keys = Self::generate_keys()?;
            Self::save_keys(&keys.0, &keys.1, &private_path, &public_path)?;
            keys
        };

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| WeftError::Crypto(format!("encode public key: {}", e)))?;

        Ok(Self {
            private_key,
            public_key,
            public_pem,
            peer_keys: RwLock::new(HashMap::new()),
        })
    }

    fn generate_keys() -> Result<(RsaPrivateKey, RsaPublicKey)> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
            .map_err(|e| WeftError::Crypto(format!("key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok((private_key, public_key))
    }

    fn save_keys(
        private_key: &RsaPrivateKey,
        public_key: &RsaPublicKey,
        private_path: &Path,
        public_path: &Path,
    ) -> Result<()> {
        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| WeftError::KeyLoadFailed(format!("encode private key: {}", e)))?;
        std::fs::write(private_path, private_pem.as_bytes())
            .map_err(|e| WeftError::KeyLoadFailed(format!("write private key: {}", e)))?;
        set_mode(private_path, 0o600)
            .map_err(|e| WeftError::KeyLoadFailed(format!("chmod private key: {}", e)))?;

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| WeftError::KeyLoadFailed(format!("encode public key: {}", e)))?;
        std::fs::write(public_path, public_pem)
            .map_err(|e| WeftError::KeyLoadFailed(format!("write public key: {}", e)))?;
        set_mode(public_path, 0o644)
            .map_err(|e| WeftError::KeyLoadFailed(format!("chmod public key: {}", e)))?;
        Ok(())
    }

    fn load_keys(private_path: &Path, public_path: &Path) -> Result<(RsaPrivateKey, RsaPublicKey)> {
        let private_pem = std::fs::read_to_string(private_path)
            .map_err(|e| WeftError::KeyLoadFailed(format!("read private key: {}", e)))?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&private_pem)
            .map_err(|e| WeftError::KeyLoadFailed(format!("parse private key: {}", e)))?;

        let public_pem = std::fs::read_to_string(public_path)
            .map_err(|e| WeftError::KeyLoadFailed(format!("read public key: {}", e)))?;
        let public_key = RsaPublicKey::from_public_key_pem(&public_pem)
            .map_err(|e| WeftError::KeyLoadFailed(format!("parse public key: {}", e)))?;

        Ok((private_key, public_key))
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Longest plaintext a single OAEP block can carry under this node's key.
    pub fn max_plaintext_len(&self) -> usize {
        self.public_key.size() - OAEP_OVERHEAD
    }

    pub async fn add_peer_key(&self, node_id: &str, pem: &str) -> Result<()> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| WeftError::Crypto(format!("invalid peer key: {}", e)))?;
        self.peer_keys.write().await.insert(node_id.to_string(), key);
        Ok(())
    }

    /// Encrypts for `node_id` and signs with our private key. Plaintexts
    /// longer than one OAEP block are split into blocks and the ciphertext
    /// blocks concatenated; a one-block message is identical to single-shot
    /// OAEP. The signature covers the whole plaintext.
    pub async fn encrypt(
        &self,
        node_id: &str,
        plaintext: &[u8],
        message_type: &str,
    ) -> Result<EncryptedEnvelope> {
        let peer_key = self
            .peer_keys
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| WeftError::NoPeerKey(node_id.to_string()))?;

        let block_len = peer_key.size() - OAEP_OVERHEAD;
        let mut rng = rand::thread_rng();
        let mut ciphertext = Vec::with_capacity(plaintext.len() + peer_key.size());
        for block in plaintext.chunks(block_len) {
            let encrypted = peer_key
                .encrypt(&mut rng, Oaep::new::<Sha256>(), block)
                .map_err(|e| WeftError::Crypto(format!("encryption failed: {}", e)))?;
            ciphertext.extend_from_slice(&encrypted);
        }

        let digest = Sha256::digest(plaintext);
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| WeftError::Crypto(format!("signing failed: {}", e)))?;

        Ok(EncryptedEnvelope {
            ciphertext: BASE64.encode(&ciphertext),
            signature: BASE64.encode(&signature),
            sender_pubkey: self.public_pem.clone(),
            timestamp: timestamp() as i64,
            message_type: message_type.to_string(),
        })
    }

    /// Decrypts with our private key and verifies the detached signature
    /// against the envelope's sender key. When a key is already stored for
    /// `sender_node_id` the envelope key must match it exactly; otherwise
    /// the envelope is dropped. The timestamp is informational only.
    pub async fn decrypt(
        &self,
        sender_node_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<(Vec<u8>, String)> {
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| WeftError::DecryptFailed(format!("ciphertext encoding: {}", e)))?;

        let block_len = self.private_key.size();
        if ciphertext.len() % block_len != 0 {
            return Err(WeftError::DecryptFailed(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                block_len
            )));
        }
        let mut plaintext = Vec::new();
        for block in ciphertext.chunks(block_len) {
            let decrypted = self
                .private_key
                .decrypt(Oaep::new::<Sha256>(), block)
                .map_err(|e| WeftError::DecryptFailed(e.to_string()))?;
            plaintext.extend_from_slice(&decrypted);
        }

        let sender_key = RsaPublicKey::from_public_key_pem(&envelope.sender_pubkey)
            .map_err(|e| WeftError::SignatureInvalid(format!("sender key: {}", e)))?;
        if let Some(stored) = self.peer_keys.read().await.get(sender_node_id) {
            if *stored != sender_key {
                return Err(WeftError::SenderKeyMismatch(sender_node_id.to_string()));
            }
        }

        let signature = BASE64
            .decode(&envelope.signature)
            .map_err(|e| WeftError::SignatureInvalid(format!("signature encoding: {}", e)))?;
        let digest = Sha256::digest(&plaintext);
        sender_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| WeftError::SignatureInvalid(sender_node_id.to_string()))?;

        Ok((plaintext, envelope.message_type.clone()))
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

// ============================================================================
// FILE TRANSFER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One transfer-protocol message, sent as the plaintext of a `"file"`-typed
/// envelope. `kind` is one of request/accept/reject/chunk/complete; the
/// other fields are populated per kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub total_chunks: usize,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug)]
pub struct FileTransfer {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunks: HashMap<usize, Vec<u8>>,
    pub total_chunks: usize,
    pub status: TransferStatus,
    pub progress: u8,
    pub peer_id: String,
    pub is_outgoing: bool,
    pub source_path: Option<PathBuf>,
}

impl FileTransfer {
    /// Concatenates received chunks in index order. Fails unless every index
    /// is present and the assembled length matches the advertised size.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        if self.chunks.len() != self.total_chunks {
            return Err(WeftError::TransferFailed(format!(
                "have {} chunks, expected {}",
                self.chunks.len(),
                self.total_chunks
            )));
        }
        let mut data = Vec::with_capacity(self.file_size as usize);
        for index in 0..self.total_chunks {
            let chunk = self
                .chunks
                .get(&index)
                .ok_or_else(|| WeftError::TransferFailed(format!("missing chunk {}", index)))?;
            data.extend_from_slice(chunk);
        }
        if data.len() as u64 != self.file_size {
            return Err(WeftError::TransferFailed(format!(
                "assembled {} bytes, expected {}",
                data.len(),
                self.file_size
            )));
        }
        Ok(data)
    }
}

fn split_into_chunks(data: &[u8]) -> HashMap<usize, Vec<u8>> {
    data.chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(index, chunk)| (index, chunk.to_vec()))
        .collect()
}

fn chunk_checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn decode_chunk(msg: &FileMessage) -> Result<Vec<u8>> {
    let data = BASE64
        .decode(&msg.data)
        .map_err(|e| WeftError::Serialization(format!("chunk data: {}", e)))?;
    if chunk_checksum(&data) != msg.checksum {
        return Err(WeftError::IntegrityMismatch {
            file_id: msg.file_id.clone(),
            chunk_index: msg.chunk_index,
        });
    }
    Ok(data)
}

fn generate_file_id() -> String {
    timestamp_nanos().to_string()
}

// ============================================================================
// VOICE MESSAGES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub audio_data: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub format: String,
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub struct Peer {
    conn_id: String,
    frame_tx: mpsc::Sender<String>,
    done: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Non-blocking submit to the bounded send queue. A full queue drops the
    /// frame and surfaces `ChannelFull` to the caller.
    fn enqueue(&self, frame: String) -> Result<()> {
        match self.frame_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(WeftError::ChannelFull(self.conn_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WeftError::ConnectionLost(self.conn_id.clone()))
            }
        }
    }

    fn fire_done(&self) {
        let _ = self.done.send_replace(true);
    }

    async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = timeout(TASK_DRAIN_TIMEOUT, handle).await;
        }
    }
}

pub struct PeerTable {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerTable {
    fn new() -> Self {
        Self { peers: RwLock::new(HashMap::new()) }
    }

    async fn insert(&self, peer: Arc<Peer>) -> Result<()> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.conn_id) {
            return Err(WeftError::DuplicatePeer(peer.conn_id.clone()));
        }
        peers.insert(peer.conn_id.clone(), peer);
        Ok(())
    }

    async fn remove(&self, conn_id: &str) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(conn_id)
    }

    async fn get(&self, conn_id: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(conn_id).cloned()
    }

    async fn contains(&self, conn_id: &str) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    async fn conn_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    async fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn shutdown_all(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut map = self.peers.write().await;
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &peers {
            peer.fire_done();
        }
        for peer in peers {
            peer.drain().await;
        }
    }
}

/// Spawns the reader/writer task pair for one established socket. The writer
/// is the only task that touches the socket's write half; the reader is the
/// only one that reports `PeerClosed`. Either task firing `done` tears the
/// pair down, which closes both halves.
fn spawn_peer(node: &Arc<Node>, stream: TcpStream, conn_id: String) -> Arc<Peer> {
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(SEND_QUEUE_CAPACITY);
    let (done_tx, _) = watch::channel(false);
    let peer = Arc::new(Peer {
        conn_id: conn_id.clone(),
        frame_tx,
        done: done_tx,
        tasks: StdMutex::new(Vec::new()),
    });
    let (read_half, mut write_half) = stream.into_split();

    let writer_peer = Arc::clone(&peer);
    let mut writer_done = peer.done.subscribe();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_done.changed() => break,
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        let mut line = frame.into_bytes();
                        line.push(b'\n');
                        if write_half.write_all(&line).await.is_err() {
                            break;
                        }
                        if write_half.flush().await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        writer_peer.fire_done();
    });

    let reader_peer = Arc::clone(&peer);
    let mut reader_done = peer.done.subscribe();
    let event_tx = node.event_tx.clone();
    let reader_conn_id = conn_id;
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = reader_done.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_frame(&line) {
                        Ok((sender_id, payload)) => {
                            let event = NodeEvent::Frame {
                                conn_id: reader_conn_id.clone(),
                                sender_id,
                                payload,
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            eprintln!("[PEER] dropping frame from {}: {}", reader_conn_id, e)
                        }
                    },
                    Ok(None) | Err(_) => break,
                },
            }
        }
        reader_peer.fire_done();
        let _ = event_tx
            .send(NodeEvent::PeerClosed { conn_id: reader_conn_id })
            .await;
    });

    peer.tasks.lock().unwrap().extend([reader, writer]);
    peer
}

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug, Clone)]
pub struct UiMessage {
    pub sender_id: String,
    pub content: String,
}

#[derive(Debug)]
enum NodeEvent {
    NewPeer { stream: TcpStream, conn_id: String, initiated: bool },
    PeerClosed { conn_id: String },
    Frame { conn_id: String, sender_id: String, payload: String },
    Command(String),
    Discovered(String),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub initial_peers: Vec<String>,
    pub disable_discovery: bool,
    pub multicast_addr: String,
    pub gossip_interval: Duration,
    pub keys_dir: PathBuf,
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":0".to_string(),
            initial_peers: Vec::new(),
            disable_discovery: false,
            multicast_addr: DEFAULT_MULTICAST_ADDR.to_string(),
            gossip_interval: GOSSIP_INTERVAL,
            keys_dir: PathBuf::from("./keys"),
            data_dir: PathBuf::from("./data"),
            downloads_dir: PathBuf::from("./downloads"),
        }
    }
}

pub struct Node {
    id: String,
    config: NodeConfig,
    crypto: CryptoEngine,
    peers: PeerTable,
    known_peers: RwLock<HashSet<String>>,
    conn_to_node: RwLock<HashMap<String, String>>,
    transfers: RwLock<HashMap<String, FileTransfer>>,
    listener: StdMutex<Option<TcpListener>>,
    discovery_socket: StdMutex<Option<Arc<UdpSocket>>>,
    event_tx: mpsc::Sender<NodeEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<NodeEvent>>>,
    ui_tx: mpsc::Sender<UiMessage>,
    shutdown_tx: watch::Sender<bool>,
    recording: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub async fn new(config: NodeConfig) -> Result<(Arc<Self>, mpsc::Receiver<UiMessage>)> {
        let listen_addr = normalize_listen_addr(&config.listen_addr);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(WeftError::BindFailed)?;
        let local_addr = listener.local_addr().map_err(WeftError::BindFailed)?;
        let id = advertised_id(local_addr);

        let keys_dir = config.keys_dir.clone();
        let crypto = tokio::task::spawn_blocking(move || CryptoEngine::new(&keys_dir))
            .await
            .map_err(|e| WeftError::KeyLoadFailed(e.to_string()))??;
        println!(
            "[CRYPTO] ready; single-block envelope capacity is {} bytes",
            crypto.max_plaintext_len()
        );

        let discovery_socket = if config.disable_discovery {
            println!("[DISCOVERY] disabled");
            None
        } else {
            match open_multicast_socket(&config.multicast_addr) {
                Ok(socket) => {
                    println!("[DISCOVERY] enabled on {}", config.multicast_addr);
                    Some(Arc::new(socket))
                }
                Err(e) => {
                    eprintln!(
                        "[DISCOVERY] unavailable ({}); use /connect <addr> to add peers manually",
                        e
                    );
                    None
                }
            }
        };

        std::fs::create_dir_all(config.data_dir.join("voice"))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (ui_tx, ui_rx) = mpsc::channel(UI_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new(Self {
            id: id.clone(),
            config,
            crypto,
            peers: PeerTable::new(),
            known_peers: RwLock::new(HashSet::from([id.clone()])),
            conn_to_node: RwLock::new(HashMap::new()),
            transfers: RwLock::new(HashMap::new()),
            listener: StdMutex::new(Some(listener)),
            discovery_socket: StdMutex::new(discovery_socket),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            ui_tx,
            shutdown_tx,
            recording: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        println!("[NODE] listening on {} (id: {})", local_addr, node.id);
        Ok((node, ui_rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the node until shutdown: spawns the accept, discovery, announce
    /// and gossip loops, dials the initial peers, then dispatches events.
    /// This task is the only one that mutates the peer table, the known-peer
    /// set and the conn-id mapping.
    pub async fn start(self: Arc<Self>) {
        let mut event_rx = match self.event_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let n = Arc::clone(&self);
        self.track(tokio::spawn(async move { n.accept_loop().await }));

        let discovery_socket = self.discovery_socket.lock().unwrap().take();
        if let Some(socket) = discovery_socket {
            let n = Arc::clone(&self);
            let s = Arc::clone(&socket);
            self.track(tokio::spawn(async move { n.discovery_reader_loop(s).await }));
            let n = Arc::clone(&self);
            self.track(tokio::spawn(async move { n.announce_loop(socket).await }));
        }
        if !self.config.disable_discovery {
            let n = Arc::clone(&self);
            self.track(tokio::spawn(async move { n.gossip_loop().await }));
        }

        for addr in self.config.initial_peers.clone() {
            let n = Arc::clone(&self);
            self.track(tokio::spawn(async move { n.dial(addr).await }));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        drop(event_rx);
        self.drain().await;
    }

    /// Signals shutdown. Idempotent; the event loop observes the signal,
    /// stops dispatching and drains every task.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        println!("[SHUTDOWN] shutting down...");
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub async fn submit_command(&self, input: String) {
        let _ = self.event_tx.send(NodeEvent::Command(input)).await;
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    async fn drain(&self) {
        self.peers.shutdown_all().await;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = timeout(TASK_DRAIN_TIMEOUT, handle).await;
        }
        println!("[SHUTDOWN] complete");
    }

    fn ui_send(&self, sender_id: &str, content: String) {
        let _ = self.ui_tx.try_send(UiMessage {
            sender_id: sender_id.to_string(),
            content,
        });
    }

    fn ui_system(&self, content: String) {
        self.ui_send("System", content);
    }

    async fn handle_event(self: &Arc<Self>, event: NodeEvent) {
        match event {
            NodeEvent::NewPeer { stream, conn_id, initiated } => {
                self.handle_new_peer(stream, conn_id, initiated).await
            }
            NodeEvent::PeerClosed { conn_id } => self.handle_peer_closed(&conn_id).await,
            NodeEvent::Frame { conn_id, sender_id, payload } => {
                self.route_frame(conn_id, sender_id, payload).await
            }
            NodeEvent::Command(input) => self.handle_command(input).await,
            NodeEvent::Discovered(node_id) => self.handle_discovered(node_id).await,
        }
    }

    // ========== PEER LIFECYCLE ==========

    async fn handle_new_peer(self: &Arc<Self>, stream: TcpStream, conn_id: String, initiated: bool) {
        if conn_id == self.id {
            println!("[PEER] refusing connection to self");
            return;
        }
        if self.peers.contains(&conn_id).await {
            println!("[PEER] already connected to {}, closing duplicate", conn_id);
            return;
        }

        let peer = spawn_peer(self, stream, conn_id.clone());
        if let Err(e) = self.peers.insert(Arc::clone(&peer)).await {
            peer.fire_done();
            println!("[PEER] {}", e);
            return;
        }
        if initiated {
            self.known_peers.write().await.insert(conn_id.clone());
        }
        println!("[PEER] connected: {}", conn_id);
        self.ui_system(format!("Peer connected: {}", conn_id));

        // Plaintext key exchange on connect. The PEM is base64-wrapped so the
        // frame stays a single line.
        let encoded_key = BASE64.encode(self.crypto.public_key_pem().as_bytes());
        let payload = format!("{}{}", KEY_EXCHANGE_PREFIX, encoded_key);
        match encode_frame(&self.id, &payload) {
            Ok(frame) => {
                if let Err(e) = peer.enqueue(frame) {
                    eprintln!("[CRYPTO] failed to send public key to {}: {}", conn_id, e);
                } else {
                    println!("[CRYPTO] sent public key to {}", conn_id);
                }
            }
            Err(e) => eprintln!("[CRYPTO] failed to frame public key: {}", e),
        }
    }

    async fn handle_peer_closed(&self, conn_id: &str) {
        if let Some(peer) = self.peers.remove(conn_id).await {
            peer.fire_done();
            self.conn_to_node.write().await.remove(conn_id);
            println!("[PEER] disconnected: {}", conn_id);
            self.ui_system(format!("Peer disconnected: {}", conn_id));
        }
    }

    pub async fn connect(self: &Arc<Self>, addr: &str) {
        self.dial(addr.to_string()).await;
    }

    async fn dial(self: &Arc<Self>, addr: String) {
        if addr.is_empty() || addr == self.id() {
            println!("[PEER] cannot connect to self or empty address");
            self.ui_system("Cannot connect to self".to_string());
            return;
        }
        if self.peers.contains(&addr).await {
            println!("[PEER] already connected to {}", addr);
            return;
        }
        println!("[PEER] connecting to {}...", addr);
        match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let event = NodeEvent::NewPeer { stream, conn_id: addr, initiated: true };
                let _ = self.event_tx.send(event).await;
            }
            Ok(Err(e)) => {
                let err = WeftError::DialFailed(format!("{}: {}", addr, e));
                eprintln!("[PEER] {}", err);
                self.ui_system(format!("Failed to connect: {}", err));
            }
            Err(_) => {
                let err = WeftError::DialFailed(format!("{}: timed out", addr));
                eprintln!("[PEER] {}", err);
                self.ui_system(format!("Failed to connect: {}", err));
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let event = NodeEvent::NewPeer {
                            stream,
                            conn_id: addr.to_string(),
                            initiated: false,
                        };
                        if self.event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if self.is_shutdown() {
                            break;
                        }
                        eprintln!("[NODE] accept error: {}", e);
                    }
                },
            }
        }
    }

    // ========== ROUTING ==========

    /// Demultiplexes one inbound frame: plaintext key exchange, encrypted
    /// envelope (text/file/voice/key_exchange), gossip, or legacy plaintext.
    async fn route_frame(self: &Arc<Self>, conn_id: String, sender_id: String, payload: String) {
        if sender_id != self.id {
            // Ephemeral conn id -> stable node id, recorded once per
            // connection. Broadcast senders use this to find the peer key.
            let inserted = {
                let mut map = self.conn_to_node.write().await;
                if map.contains_key(&conn_id) {
                    false
                } else {
                    map.insert(conn_id.clone(), sender_id.clone());
                    true
                }
            };
            if inserted {
                self.known_peers.write().await.insert(sender_id.clone());
            }
        }

        if let Some(encoded) = payload.strip_prefix(KEY_EXCHANGE_PREFIX) {
            self.handle_key_exchange(&sender_id, encoded).await;
            return;
        }

        if let Ok(envelope) = serde_json::from_str::<EncryptedEnvelope>(&payload) {
            match self.crypto.decrypt(&sender_id, &envelope).await {
                Ok((plaintext, message_type)) => match message_type.as_str() {
                    "text" => {
                        self.ui_send(&sender_id, String::from_utf8_lossy(&plaintext).into_owned())
                    }
                    "file" => match serde_json::from_slice::<FileMessage>(&plaintext) {
                        Ok(msg) => self.handle_file_message(&sender_id, msg).await,
                        Err(e) => {
                            eprintln!("[FILE] bad file message from {}: {}", sender_id, e)
                        }
                    },
                    "voice" => match serde_json::from_slice::<VoiceMessage>(&plaintext) {
                        Ok(msg) => self.handle_voice_message(&sender_id, msg).await,
                        Err(e) => {
                            eprintln!("[VOICE] bad voice message from {}: {}", sender_id, e)
                        }
                    },
                    "key_exchange" => match std::str::from_utf8(&plaintext) {
                        Ok(pem) => match self.crypto.add_peer_key(&sender_id, pem).await {
                            Ok(()) => println!("[CRYPTO] rotated key for {}", sender_id),
                            Err(e) => {
                                eprintln!("[CRYPTO] key rotation from {} rejected: {}", sender_id, e)
                            }
                        },
                        Err(_) => eprintln!("[CRYPTO] non-utf8 key rotation from {}", sender_id),
                    },
                    other => eprintln!("[NODE] unknown message type '{}' from {}", other, sender_id),
                },
                Err(e) => eprintln!("[CRYPTO] dropping envelope from {}: {}", sender_id, e),
            }
            return;
        }

        if let Some(csv) = payload.strip_prefix(GOSSIP_PREFIX) {
            for id in parse_gossip(csv) {
                self.handle_discovered(id).await;
            }
            return;
        }

        // Legacy/system plaintext goes to the UI verbatim.
        self.ui_send(&sender_id, payload);
    }

    async fn handle_key_exchange(&self, sender_id: &str, encoded: &str) {
        let pem_bytes = match BASE64.decode(encoded) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("[CRYPTO] bad key exchange encoding from {}: {}", sender_id, e);
                return;
            }
        };
        let pem = match String::from_utf8(pem_bytes) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("[CRYPTO] non-utf8 key exchange from {}", sender_id);
                return;
            }
        };
        match self.crypto.add_peer_key(sender_id, &pem).await {
            Ok(()) => {
                println!("[CRYPTO] added public key for peer {}", sender_id);
                self.ui_system(format!("Added public key for peer {}", sender_id));
            }
            Err(e) => eprintln!("[CRYPTO] failed to add key for {}: {}", sender_id, e),
        }
    }

    // ========== DISCOVERY & GOSSIP ==========

    /// Autoconnect gate: not self, not connected, not already known. The id
    /// is recorded and dialed in one step, so repeat announcements never
    /// cause repeat dials; a once-seen peer is not redialed after it drops.
    async fn handle_discovered(self: &Arc<Self>, node_id: String) {
        if node_id.is_empty() || node_id == self.id {
            return;
        }
        if self.peers.contains(&node_id).await
            || self.conn_to_node.read().await.values().any(|v| v == &node_id)
        {
            self.known_peers.write().await.insert(node_id);
            return;
        }
        if !self.known_peers.write().await.insert(node_id.clone()) {
            return;
        }
        println!("[DISCOVERY] auto-discovered peer: {}", node_id);
        self.ui_system(format!("Discovered peer: {}", node_id));
        let n = Arc::clone(self);
        self.track(tokio::spawn(async move { n.dial(node_id).await }));
    }

    async fn discovery_reader_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 1024];
        while !self.is_shutdown() {
            let (len, src) = match timeout(DISCOVERY_READ_TIMEOUT, socket.recv_from(&mut buf)).await
            {
                Err(_) => continue,
                Ok(Err(e)) => {
                    if self.is_shutdown() {
                        break;
                    }
                    eprintln!("[DISCOVERY] read error: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let datagram = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let (command, node_id) = match parse_discovery(datagram) {
                Some(parsed) => parsed,
                None => continue,
            };
            match command {
                DISCOVER_CMD => {
                    if node_id != self.id {
                        let _ = self
                            .event_tx
                            .send(NodeEvent::Discovered(node_id.to_string()))
                            .await;
                        let reply = encode_discovery(DISCOVER_RESPONSE_CMD, &self.id);
                        let _ = socket.send_to(reply.as_bytes(), src).await;
                    }
                }
                DISCOVER_RESPONSE_CMD => {
                    if node_id != self.id {
                        let _ = self
                            .event_tx
                            .send(NodeEvent::Discovered(node_id.to_string()))
                            .await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn announce_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let group: SocketAddr = match self.config.multicast_addr.parse() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sleep(ANNOUNCE_INTERVAL) => {}
            }
            if self.is_shutdown() {
                break;
            }
            let announce = encode_discovery(DISCOVER_CMD, &self.id);
            if let Err(e) = socket.send_to(announce.as_bytes(), group).await {
                eprintln!("[DISCOVERY] announce failed: {}", e);
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sleep(self.config.gossip_interval) => {}
            }
            if self.is_shutdown() {
                break;
            }
            self.send_gossip().await;
        }
    }

    async fn send_gossip(&self) {
        let payload = match encode_gossip(&*self.known_peers.read().await, &self.id) {
            Some(payload) => payload,
            None => return,
        };
        let frame = match encode_frame(&self.id, &payload) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        for peer in self.peers.all().await {
            if let Err(e) = peer.enqueue(frame.clone()) {
                println!("[GOSSIP] dropping gossip for {}: {}", peer.conn_id, e);
            }
        }
    }

    // ========== OUTBOUND ==========

    /// Encrypts `plaintext` per peer and enqueues it to every connected
    /// peer. Peers whose node id is still unknown, or whose key has not
    /// arrived yet, are skipped and logged.
    async fn broadcast_envelope(&self, plaintext: &[u8], message_type: &str) {
        for peer in self.peers.all().await {
            let node_id = match self.conn_to_node.read().await.get(&peer.conn_id).cloned() {
                Some(id) => id,
                None => {
                    println!("[NODE] skipping {}: no node id mapping yet", peer.conn_id);
                    continue;
                }
            };
            match self.crypto.encrypt(&node_id, plaintext, message_type).await {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => match encode_frame(&self.id, &json) {
                        Ok(frame) => {
                            if let Err(e) = peer.enqueue(frame) {
                                println!("[NODE] dropping message for {}: {}", peer.conn_id, e);
                            }
                        }
                        Err(e) => eprintln!("[NODE] failed to frame message: {}", e),
                    },
                    Err(e) => {
                        eprintln!("[NODE] failed to serialize envelope for {}: {}", node_id, e)
                    }
                },
                Err(e) => println!("[NODE] skipping {} ({}): {}", peer.conn_id, node_id, e),
            }
        }
    }

    pub async fn broadcast_text(&self, text: &str) {
        self.broadcast_envelope(text.as_bytes(), "text").await;
    }

    /// Sends are addressed by conn id; keys are stored by node id. Direct
    /// table hit covers outbound dials, the reverse mapping covers inbound
    /// accepts.
    async fn resolve_conn(&self, node_id: &str) -> Option<String> {
        if self.peers.contains(node_id).await {
            return Some(node_id.to_string());
        }
        self.conn_to_node
            .read()
            .await
            .iter()
            .find(|(_, mapped)| mapped.as_str() == node_id)
            .map(|(conn_id, _)| conn_id.clone())
    }

    pub async fn send_envelope_to(&self, node_id: &str, plaintext: &[u8], message_type: &str) -> Result<()> {
        let conn_id = self
            .resolve_conn(node_id)
            .await
            .ok_or_else(|| WeftError::ConnectionLost(format!("peer not found: {}", node_id)))?;
        let peer = self
            .peers
            .get(&conn_id)
            .await
            .ok_or_else(|| WeftError::ConnectionLost(format!("peer not found: {}", node_id)))?;
        let envelope = self.crypto.encrypt(node_id, plaintext, message_type).await?;
        let json =
            serde_json::to_string(&envelope).map_err(|e| WeftError::Serialization(e.to_string()))?;
        let frame = encode_frame(&self.id, &json)?;
        peer.enqueue(frame)
    }

    // ========== COMMANDS ==========

    async fn handle_command(self: &Arc<Self>, input: String) {
        let input = input.trim().to_string();
        if input.is_empty() {
            return;
        }
        if !input.starts_with('/') {
            self.broadcast_text(&input).await;
            self.ui_send(&self.id, input);
            return;
        }

        let mut parts = input.splitn(2, ' ');
        let command = parts.next().unwrap_or("");
        let arg = parts.next().unwrap_or("").trim();

        match command {
            "/connect" if !arg.is_empty() => {
                let n = Arc::clone(self);
                let addr = arg.to_string();
                self.track(tokio::spawn(async move { n.connect(&addr).await }));
            }
            "/connect" => self.ui_system("Usage: /connect <host:port>".to_string()),
            "/peers" => self.list_peers().await,
            "/discovered" => self.list_discovered().await,
            "/sendfile" => self.command_send_file(arg).await,
            "/voice" => self.command_voice(arg).await,
            "/transfers" => self.list_transfers().await,
            "/help" => self.ui_system(help_text()),
            "/quit" | "/exit" => self.shutdown(),
            _ => self.ui_system(format!("Unknown command: {}. Type /help for commands.", command)),
        }
    }

    async fn list_peers(&self) {
        if self.peers.len().await == 0 {
            self.ui_system("No connected peers".to_string());
            return;
        }
        let conn_ids = self.peers.conn_ids().await;
        let map = self.conn_to_node.read().await;
        let mut out = String::from("Connected peers:");
        for conn_id in conn_ids {
            match map.get(&conn_id) {
                Some(node_id) if *node_id != conn_id => {
                    out.push_str(&format!("\n  - {} (node {})", conn_id, node_id))
                }
                _ => out.push_str(&format!("\n  - {}", conn_id)),
            }
        }
        self.ui_system(out);
    }

    async fn list_discovered(&self) {
        let known: Vec<String> = {
            let set = self.known_peers.read().await;
            let mut ids: Vec<String> = set.iter().cloned().collect();
            ids.sort();
            ids
        };
        let connected = self.connected_node_ids().await;
        let mut out = String::from("All discovered peers:");
        for id in known {
            let status = if id == self.id {
                "self"
            } else if connected.contains(&id) {
                "connected"
            } else {
                "disconnected"
            };
            out.push_str(&format!("\n  - {} [{}]", id, status));
        }
        self.ui_system(out);
    }

    pub async fn connected_node_ids(&self) -> HashSet<String> {
        let map = self.conn_to_node.read().await;
        self.peers
            .conn_ids()
            .await
            .into_iter()
            .map(|conn_id| map.get(&conn_id).cloned().unwrap_or(conn_id))
            .collect()
    }

    async fn command_send_file(self: &Arc<Self>, arg: &str) {
        let tokens: Vec<&str> = arg.split_whitespace().collect();
        if tokens.len() < 2 {
            self.ui_system("Usage: /sendfile <node_id> <file_path>".to_string());
            return;
        }
        let node_id = tokens[0].to_string();
        let path = PathBuf::from(tokens[1..].join(" "));
        let n = Arc::clone(self);
        self.track(tokio::spawn(async move { n.send_file(node_id, path).await }));
    }

    async fn command_voice(self: &Arc<Self>, arg: &str) {
        let seconds = match arg.parse::<u64>() {
            Ok(s) if (1..=MAX_VOICE_SECS).contains(&s) => s,
            _ => {
                self.ui_system(format!("Usage: /voice <seconds> (1-{})", MAX_VOICE_SECS));
                return;
            }
        };
        let n = Arc::clone(self);
        self.track(tokio::spawn(async move { n.record_and_broadcast_voice(seconds).await }));
    }

    async fn list_transfers(&self) {
        let transfers = self.transfers.read().await;
        if transfers.is_empty() {
            self.ui_system("No active transfers".to_string());
            return;
        }
        let mut out = String::from("Active transfers:");
        for transfer in transfers.values() {
            let direction = if transfer.is_outgoing { "->" } else { "<-" };
            out.push_str(&format!(
                "\n  {} {} {} {} [{}] {}%",
                transfer.file_id,
                direction,
                transfer.peer_id,
                transfer.file_name,
                transfer.status,
                transfer.progress
            ));
            if let Some(path) = &transfer.source_path {
                out.push_str(&format!(" ({})", path.display()));
            }
        }
        self.ui_system(out);
    }

    // ========== FILE TRANSFER ==========

    async fn handle_file_message(self: &Arc<Self>, sender_id: &str, msg: FileMessage) {
        match msg.kind.as_str() {
            "request" => self.handle_file_request(sender_id, msg).await,
            "accept" => self.handle_file_accept(sender_id, msg).await,
            "reject" => self.handle_file_reject(sender_id, msg).await,
            "chunk" => self.handle_file_chunk(sender_id, msg).await,
            "complete" => self.handle_file_complete(sender_id, msg).await,
            other => eprintln!("[FILE] unknown file message type '{}' from {}", other, sender_id),
        }
    }

    async fn send_file_message(&self, node_id: &str, msg: &FileMessage) -> Result<()> {
        let json = serde_json::to_vec(msg).map_err(|e| WeftError::Serialization(e.to_string()))?;
        self.send_envelope_to(node_id, &json, "file").await
    }

    pub async fn send_file(self: &Arc<Self>, node_id: String, path: PathBuf) {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                eprintln!("[FILE] failed to read {}: {}", path.display(), e);
                self.ui_system(format!("Failed to read {}: {}", path.display(), e));
                return;
            }
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let file_id = generate_file_id();
        let chunks = split_into_chunks(&data);
        let total_chunks = chunks.len();

        let transfer = FileTransfer {
            file_id: file_id.clone(),
            file_name: file_name.clone(),
            file_size: data.len() as u64,
            chunks,
            total_chunks,
            status: TransferStatus::Pending,
            progress: 0,
            peer_id: node_id.clone(),
            is_outgoing: true,
            source_path: Some(path),
        };
        self.transfers.write().await.insert(file_id.clone(), transfer);

        let request = FileMessage {
            kind: "request".to_string(),
            file_id: file_id.clone(),
            file_name: file_name.clone(),
            file_size: data.len() as u64,
            total_chunks,
            ..FileMessage::default()
        };
        if let Err(e) = self.send_file_message(&node_id, &request).await {
            self.transfers.write().await.remove(&file_id);
            eprintln!("[FILE] failed to send transfer request to {}: {}", node_id, e);
            self.ui_system(format!("Failed to send file request to {}: {}", node_id, e));
            return;
        }
        println!(
            "[FILE] transfer request sent: {} ({} bytes, {} chunks)",
            file_name,
            data.len(),
            total_chunks
        );
        self.ui_system(format!(
            "Sending file to {}: {} ({} bytes)",
            node_id,
            file_name,
            data.len()
        ));
    }

    /// Receiver side auto-accepts; accept/reject policy belongs to the
    /// front-end eventually.
    async fn handle_file_request(&self, sender_id: &str, msg: FileMessage) {
        println!(
            "[FILE] transfer request from {}: {} ({} bytes)",
            sender_id, msg.file_name, msg.file_size
        );
        let transfer = FileTransfer {
            file_id: msg.file_id.clone(),
            file_name: msg.file_name.clone(),
            file_size: msg.file_size,
            chunks: HashMap::new(),
            total_chunks: msg.total_chunks,
            status: TransferStatus::Active,
            progress: 0,
            peer_id: sender_id.to_string(),
            is_outgoing: false,
            source_path: None,
        };
        self.transfers.write().await.insert(msg.file_id.clone(), transfer);

        let accept = FileMessage {
            kind: "accept".to_string(),
            file_id: msg.file_id.clone(),
            ..FileMessage::default()
        };
        if let Err(e) = self.send_file_message(sender_id, &accept).await {
            eprintln!("[FILE] failed to send accept to {}: {}", sender_id, e);
        }
        self.ui_system(format!(
            "Receiving file from {}: {} ({} bytes)",
            sender_id, msg.file_name, msg.file_size
        ));
    }

    async fn handle_file_accept(self: &Arc<Self>, sender_id: &str, msg: FileMessage) {
        {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&msg.file_id) {
                Some(transfer) if transfer.is_outgoing => {
                    transfer.status = TransferStatus::Active
                }
                _ => {
                    eprintln!("[FILE] accept for unknown transfer {}", msg.file_id);
                    return;
                }
            }
        }
        println!("[FILE] transfer accepted by {}, sending chunks", sender_id);
        let n = Arc::clone(self);
        let node_id = sender_id.to_string();
        let file_id = msg.file_id;
        self.track(tokio::spawn(async move { n.stream_chunks(node_id, file_id).await }));
    }

    async fn handle_file_reject(&self, sender_id: &str, msg: FileMessage) {
        println!("[FILE] transfer rejected by {}", sender_id);
        self.fail_transfer(&msg.file_id, format!("rejected by {}", sender_id)).await;
    }

    /// One task per outgoing transfer; chunks go out in index order through
    /// the peer's send queue, with a short pacing delay so the bounded queue
    /// is not saturated.
    async fn stream_chunks(self: &Arc<Self>, node_id: String, file_id: String) {
        let total_chunks = match self.transfers.read().await.get(&file_id) {
            Some(transfer) => transfer.total_chunks,
            None => return,
        };
        for index in 0..total_chunks {
            if self.is_shutdown() {
                return;
            }
            let data = match self
                .transfers
                .read()
                .await
                .get(&file_id)
                .and_then(|t| t.chunks.get(&index).cloned())
            {
                Some(data) => data,
                None => {
                    self.fail_transfer(&file_id, format!("missing chunk {}", index)).await;
                    return;
                }
            };
            let chunk_msg = FileMessage {
                kind: "chunk".to_string(),
                file_id: file_id.clone(),
                chunk_index: index,
                total_chunks,
                checksum: chunk_checksum(&data),
                data: BASE64.encode(&data),
                ..FileMessage::default()
            };
            if let Err(e) = self.send_file_message(&node_id, &chunk_msg).await {
                eprintln!("[FILE] failed to send chunk {}: {}", index, e);
                self.fail_transfer(&file_id, format!("failed to send chunk {}: {}", index, e))
                    .await;
                return;
            }
            if let Some(transfer) = self.transfers.write().await.get_mut(&file_id) {
                transfer.progress = (((index + 1) * 100) / total_chunks) as u8;
            }
            sleep(CHUNK_PACING).await;
        }

        let complete = FileMessage {
            kind: "complete".to_string(),
            file_id: file_id.clone(),
            ..FileMessage::default()
        };
        if let Err(e) = self.send_file_message(&node_id, &complete).await {
            self.fail_transfer(&file_id, format!("failed to send completion: {}", e)).await;
            return;
        }
        if let Some(mut transfer) = self.transfers.write().await.remove(&file_id) {
            transfer.status = TransferStatus::Complete;
            println!("[FILE] transfer complete: {}", transfer.file_name);
            self.ui_system(format!("File sent successfully: {}", transfer.file_name));
        }
    }

    async fn handle_file_chunk(&self, sender_id: &str, msg: FileMessage) {
        let data = match decode_chunk(&msg) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("[FILE] dropping chunk {} from {}: {}", msg.chunk_index, sender_id, e);
                return;
            }
        };
        let mut transfers = self.transfers.write().await;
        let transfer = match transfers.get_mut(&msg.file_id) {
            Some(transfer) if !transfer.is_outgoing => transfer,
            _ => {
                eprintln!("[FILE] chunk for unknown transfer {}", msg.file_id);
                return;
            }
        };
        if transfer.total_chunks == 0 || msg.chunk_index >= transfer.total_chunks {
            eprintln!("[FILE] chunk index {} out of range", msg.chunk_index);
            return;
        }
        transfer.chunks.insert(msg.chunk_index, data);
        transfer.progress = ((transfer.chunks.len() * 100) / transfer.total_chunks) as u8;
        println!(
            "[FILE] received chunk {}/{} ({}%)",
            msg.chunk_index + 1,
            transfer.total_chunks,
            transfer.progress
        );
    }

    async fn handle_file_complete(&self, sender_id: &str, msg: FileMessage) {
        let assembled = {
            let transfers = self.transfers.read().await;
            match transfers.get(&msg.file_id) {
                Some(transfer) if !transfer.is_outgoing => {
                    transfer.assemble().map(|data| (transfer.file_name.clone(), data))
                }
                _ => {
                    eprintln!("[FILE] completion for unknown transfer {}", msg.file_id);
                    return;
                }
            }
        };
        match assembled {
            Ok((file_name, data)) => match self.write_download(&file_name, &data).await {
                Ok(path) => {
                    if let Some(mut transfer) = self.transfers.write().await.remove(&msg.file_id) {
                        transfer.status = TransferStatus::Complete;
                    }
                    println!(
                        "[FILE] received successfully: {} ({} bytes) from {}",
                        file_name,
                        data.len(),
                        sender_id
                    );
                    self.ui_system(format!(
                        "File received successfully: {} (saved to {})",
                        file_name,
                        path.display()
                    ));
                }
                Err(e) => self.fail_transfer(&msg.file_id, format!("failed to save: {}", e)).await,
            },
            Err(e) => self.fail_transfer(&msg.file_id, e.to_string()).await,
        }
    }

    async fn fail_transfer(&self, file_id: &str, reason: String) {
        if let Some(mut transfer) = self.transfers.write().await.remove(file_id) {
            transfer.status = TransferStatus::Failed;
            self.ui_system(format!(
                "File transfer failed: {} ({})",
                transfer.file_name, reason
            ));
        }
        eprintln!("[FILE] transfer {} failed: {}", file_id, reason);
    }

    /// Filesystem sink for completed downloads. Name collisions overwrite.
    async fn write_download(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        tokio::fs::create_dir_all(&self.config.downloads_dir).await?;
        let path = self.config.downloads_dir.join(name);
        tokio::fs::write(&path, data).await?;
        set_mode(&path, 0o644)?;
        Ok(path)
    }

    // ========== VOICE ==========

    async fn record_and_broadcast_voice(self: &Arc<Self>, seconds: u64) {
        if self.recording.swap(true, Ordering::SeqCst) {
            self.ui_system("Already recording".to_string());
            return;
        }
        let result = self.record_voice(seconds).await;
        self.recording.store(false, Ordering::SeqCst);

        let audio = match result {
            Ok(audio) => audio,
            Err(e) => {
                eprintln!("[VOICE] recording failed: {}", e);
                self.ui_system(format!("Failed to record voice message: {}", e));
                return;
            }
        };
        let msg = VoiceMessage {
            kind: "voice".to_string(),
            audio_data: BASE64.encode(&audio),
            duration: seconds,
            sample_rate: VOICE_SAMPLE_RATE,
            format: "mp3".to_string(),
        };
        match serde_json::to_vec(&msg) {
            Ok(json) => {
                self.broadcast_envelope(&json, "voice").await;
                println!("[VOICE] voice message recorded and sent");
                self.ui_system(format!("Voice message sent ({}s)", seconds));
            }
            Err(e) => eprintln!("[VOICE] failed to serialize voice message: {}", e),
        }
    }

    /// Records via ffmpeg (input device per platform, as the external audio
    /// collaborator expects) and converts to mp3 for transport.
    async fn record_voice(&self, seconds: u64) -> Result<Vec<u8>> {
        let voice_dir = self.config.data_dir.join("voice");
        let stamp = timestamp_nanos();
        let wav_path = voice_dir.join(format!("recording_{}.wav", stamp));
        let mp3_path = voice_dir.join(format!("recording_{}.mp3", stamp));

        println!("[VOICE] recording for {} seconds...", seconds);
        let (input_format, input_device) = match std::env::consts::OS {
            "windows" => ("dshow", "audio=Microphone"),
            "macos" => ("avfoundation", ":0"),
            "linux" => ("pulse", "default"),
            other => {
                return Err(WeftError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported platform: {}", other),
                )))
            }
        };
        run_ffmpeg(&[
            "-f",
            input_format,
            "-i",
            input_device,
            "-t",
            &seconds.to_string(),
            "-ar",
            &VOICE_SAMPLE_RATE.to_string(),
            "-ac",
            "1",
            &wav_path.display().to_string(),
        ])
        .await?;
        run_ffmpeg(&[
            "-i",
            &wav_path.display().to_string(),
            "-codec:a",
            "libmp3lame",
            "-qscale:a",
            "2",
            &mp3_path.display().to_string(),
        ])
        .await?;

        let audio = tokio::fs::read(&mp3_path).await?;
        let _ = tokio::fs::remove_file(&wav_path).await;
        let _ = tokio::fs::remove_file(&mp3_path).await;
        Ok(audio)
    }

    /// Inbound voice: decode and hand the blob to the external consumer by
    /// saving it under the voice scratch directory.
    async fn handle_voice_message(&self, sender_id: &str, msg: VoiceMessage) {
        println!("[VOICE] voice message from {} ({}s)", sender_id, msg.duration);
        let audio = match BASE64.decode(&msg.audio_data) {
            Ok(audio) => audio,
            Err(e) => {
                eprintln!("[VOICE] failed to decode audio from {}: {}", sender_id, e);
                return;
            }
        };
        let extension: String = msg.format.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let extension = if extension.is_empty() { "bin".to_string() } else { extension };
        let path = self
            .config
            .data_dir
            .join("voice")
            .join(format!("received_{}.{}", timestamp_nanos(), extension));
        match tokio::fs::write(&path, &audio).await {
            Ok(()) => self.ui_system(format!(
                "Voice message from {} ({}s, saved to {})",
                sender_id,
                msg.duration,
                path.display()
            )),
            Err(e) => eprintln!("[VOICE] failed to save voice message: {}", e),
        }
    }
}

async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("ffmpeg")
        .arg("-y")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(WeftError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("ffmpeg failed: {}", String::from_utf8_lossy(&output.stderr)),
        )));
    }
    Ok(())
}

// ============================================================================
// SOCKET SETUP
// ============================================================================

fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// The advertised node id must be dialable; an unspecified bind address is
/// substituted with the loopback address.
fn advertised_id(local: SocketAddr) -> String {
    if local.ip().is_unspecified() {
        format!("127.0.0.1:{}", local.port())
    } else {
        local.to_string()
    }
}

/// Multicast listener bound to the group port with address/port reuse so
/// several nodes on one host can share it.
fn open_multicast_socket(multicast_addr: &str) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let group: SocketAddr = multicast_addr
        .parse()
        .map_err(|e: std::net::AddrParseError| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let group_ip = match group.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "multicast group must be IPv4",
            ))
        }
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], group.port()));
    socket.bind(&bind_addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.join_multicast_v4(&group_ip, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_socket.set_multicast_ttl_v4(1)?;
    std_socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(std_socket)
}

// ============================================================================
// UTILITIES
// ============================================================================

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn help_text() -> String {
    [
        "Available commands:",
        "  /connect <host:port>         Connect to a peer",
        "  /peers                       List connected peers",
        "  /discovered                  List discovered peers",
        "  /sendfile <node_id> <path>   Send a file to a peer",
        "  /voice <seconds>             Record and broadcast a voice message (1-60s)",
        "  /transfers                   List active file transfers",
        "  /help                        Show this help",
        "  /quit                        Exit",
        "",
        "Anything else typed at the prompt is encrypted per peer (RSA-2048)",
        "and broadcast to every connected peer that has completed the key",
        "exchange. Peers running single-block RSA builds can only accept",
        "messages up to 190 bytes.",
    ]
    .join("\n")
}

fn print_help() {
    println!("{}", help_text());
}

// ============================================================================
// MAIN
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Encrypted peer-to-peer mesh messenger")]
struct Args {
    /// Address to listen on (:0 = auto-assign port)
    #[arg(long, default_value = ":0")]
    listen: String,

    /// Peer address to dial at startup (repeatable)
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<String>,

    /// Disable multicast discovery and gossip
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = NodeConfig {
        listen_addr: args.listen,
        initial_peers: args.peers,
        disable_discovery: args.no_discovery,
        ..NodeConfig::default()
    };

    let (node, mut ui_rx) = match Node::new(config).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("[FATAL] failed to start: {}", e);
            std::process::exit(1);
        }
    };

    print_help();

    tokio::spawn(async move {
        while let Some(msg) = ui_rx.recv().await {
            println!("[{}] {}", msg.sender_id, msg.content);
        }
    });

    let stdin_node = Arc::clone(&node);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let input = line.trim();
                    if !input.is_empty() {
                        stdin_node.submit_command(input.to_string()).await;
                    }
                }
                _ => break,
            }
        }
        stdin_node.shutdown();
    });

    node.start().await;
}

// ============================================================================
// TESTS
// ============================================================================
