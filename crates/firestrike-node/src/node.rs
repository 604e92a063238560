//! Node orchestration
//!
//! A node is either stopped or running. `start` binds the transport,
//! generates a fresh identity and spawns the accept loop and the liveness
//! monitor; `stop` tears all of that down again. Protocol operations fail
//! with `NotRunning` while stopped.

use crate::client::{FindReply, PeerClient};
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::handler::{serve_connection, HandlerContext};
use crate::liveness::{LivenessMonitor, SweepReport};
use firestrike_crypto::{
    decrypt_stream, encrypt_stream, generate_key, ContentHasher, ContentId, MagnetLink,
    NodeIdentity, Salt, SymmetricKey, IV_SIZE,
};
use firestrike_dht::{now, ContentStore, ObserveOutcome, PeerDirectory, PeerRecord};
use firestrike_network::{Listener, Transport};
use firestrike_protocol::PeerInfo;
use futures::future::join_all;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Main node orchestrator
pub struct Node {
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<ContentStore>,
    directory: Arc<RwLock<PeerDirectory>>,
    client: PeerClient,
    running: Mutex<Option<Running>>,
}

/// Everything that exists only while the node is running
struct Running {
    identity: NodeIdentity,
    public_key: String,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    liveness_task: JoinHandle<()>,
    liveness: LivenessMonitor,
}

/// Local identity as announced to peers
#[derive(Clone)]
struct Session {
    address: String,
    public_key: String,
}

/// Result of a single `find` against one peer
enum FindOutcome {
    /// Verified artifact received into a staging file
    Found { staged: PathBuf },
    NotFound { hints: Vec<String> },
    /// The peer holds the object but it exceeds our size limit
    TooLarge(NodeError),
    Failed,
}

impl Node {
    /// Create a stopped node, opening its content store
    pub async fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = ContentStore::open(config.store_directory()).await?;
        let directory = PeerDirectory::new(config.dht.max_peers, config.dht.peer_timeout_secs);
        let client = PeerClient::new(
            transport.clone(),
            config.dht.request_timeout(),
            config.dht.max_frame_bytes,
        )
        .with_max_object_bytes(config.dht.max_object_bytes);

        Ok(Self {
            config,
            transport,
            store: Arc::new(store),
            directory: Arc::new(RwLock::new(directory)),
            client,
            running: Mutex::new(None),
        })
    }

    /// Start listening and serving
    ///
    /// Returns the address peers use to reach this node.
    pub async fn start(&self) -> Result<String> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        firestrike_crypto::init()?;

        let listener = self
            .transport
            .listen(&self.config.node.listen_host, self.config.node.listen_port)
            .await?;
        let address = listener.local_address().to_string();
        let identity = NodeIdentity::generate(address.clone());
        let public_key = hex::encode(identity.public_key_bytes());

        self.directory.write().await.set_local_peer(address.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = HandlerContext {
            store: self.store.clone(),
            directory: self.directory.clone(),
            local_address: address.clone(),
            public_key: public_key.clone(),
            max_frame_bytes: self.config.dht.max_frame_bytes,
            max_object_bytes: self.config.dht.max_object_bytes,
            io_timeout: self.config.dht.request_timeout(),
        };
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            shutdown_rx.clone(),
            self.config.dht.shutdown_grace(),
        ));

        let liveness = LivenessMonitor {
            directory: self.directory.clone(),
            client: self.client.clone(),
            local_address: address.clone(),
            public_key: public_key.clone(),
            interval: self.config.dht.ping_interval(),
        };
        let liveness_task = tokio::spawn(liveness.clone().run(shutdown_rx));

        info!("FireStrike node running at {} via {}", address, self.transport.name());
        debug!("Node identity: {:?}", identity);

        *running = Some(Running {
            identity,
            public_key,
            shutdown_tx,
            accept_task,
            liveness_task,
            liveness,
        });

        Ok(address)
    }

    /// Stop serving
    ///
    /// Idempotent. Waits for the liveness monitor to finish, then closes
    /// the listener and gives in-flight handlers a grace period.
    pub async fn stop(&self) -> Result<()> {
        let state = match self.running.lock().await.take() {
            Some(state) => state,
            None => return Ok(()),
        };

        info!("Stopping node at {}...", state.identity.listen_address);
        let _ = state.shutdown_tx.send(true);

        if let Err(e) = state.liveness_task.await {
            warn!("Liveness monitor ended abnormally: {}", e);
        }
        if let Err(e) = state.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        info!("Node stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address of the running node
    pub async fn local_address(&self) -> Option<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.identity.listen_address.clone())
    }

    /// Local content store
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of the peer directory
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.directory.read().await.snapshot()
    }

    async fn session(&self) -> Result<Session> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| Session {
                address: r.identity.listen_address.clone(),
                public_key: r.public_key.clone(),
            })
            .ok_or(NodeError::NotRunning)
    }

    /// Drop expired peers after a failed contact
    async fn note_failure(&self, address: &str, error: &NodeError) {
        debug!("Contact with {} failed: {}", address, error);
        let evicted = self.directory.write().await.evict_stale(now());
        if !evicted.is_empty() {
            debug!("Evicted {} stale peers", evicted.len());
        }
    }

    /// Ping a peer and add it to the directory if it answers
    pub async fn join(&self, address: &str) -> Result<ObserveOutcome> {
        let session = self.session().await?;
        if address == session.address {
            return Ok(ObserveOutcome::Ignored);
        }

        let public_key = self
            .client
            .ping(address, &session.address, &session.public_key)
            .await?;

        let outcome = self.directory.write().await.observe(address, &public_key);
        info!("Joined {} ({:?})", address, outcome);
        Ok(outcome)
    }

    /// Join each address, then join the peers they know about
    ///
    /// Returns the directory size afterwards. Unreachable addresses are
    /// skipped.
    pub async fn bootstrap(&self, addresses: &[String]) -> Result<usize> {
        let session = self.session().await?;

        let mut joined = Vec::new();
        for address in addresses {
            match self.join(address).await {
                Ok(ObserveOutcome::Inserted | ObserveOutcome::Refreshed) => {
                    joined.push(address.clone())
                }
                Ok(_) => {}
                Err(e) => warn!("Bootstrap node {} unavailable: {}", address, e),
            }
        }

        for address in &joined {
            let learned = match self.client.get_peers(address, &session.address).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!("Could not fetch peers from {}: {}", address, e);
                    continue;
                }
            };

            for info in learned {
                if info.address == session.address {
                    continue;
                }
                let known = {
                    let directory = self.directory.read().await;
                    directory.contains(&info.address) || directory.is_full()
                };
                if known {
                    continue;
                }
                if let Err(e) = self.join(&info.address).await {
                    debug!("Skipping advertised peer {}: {}", info.address, e);
                }
            }
        }

        let size = self.directory.read().await.len();
        info!("Bootstrap complete: {} peers known", size);
        Ok(size)
    }

    /// Fetch the peer list of a remote node
    pub async fn fetch_peers(&self, address: &str) -> Result<Vec<PeerInfo>> {
        let session = self.session().await?;
        self.client.get_peers(address, &session.address).await
    }

    /// Run one liveness sweep now
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let liveness = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.liveness.clone())
            .ok_or(NodeError::NotRunning)?;
        Ok(liveness.sweep().await)
    }

    /// Encrypt a file, store it locally and replicate it to peers
    ///
    /// Succeeds as soon as the local copy is committed; replication is best
    /// effort. Files whose ciphertext would exceed `dht.max_object_bytes`
    /// are refused up front since no peer with the same limit would take
    /// them.
    pub async fn upload(&self, path: impl AsRef<Path>) -> Result<MagnetLink> {
        let session = self.session().await?;
        let source = path.as_ref().to_path_buf();

        let plaintext_len = tokio::fs::metadata(&source).await?.len();
        let artifact_len = artifact_size(plaintext_len);
        if artifact_len > self.config.dht.max_object_bytes {
            return Err(NodeError::FileTooLarge {
                path: source,
                size: artifact_len,
                max: self.config.dht.max_object_bytes,
            });
        }

        let key = generate_key();
        let staged = self.store.staging_path();

        let encrypted = {
            let key = key.clone();
            let staged = staged.clone();
            tokio::task::spawn_blocking(move || encrypt_to_file(&source, &staged, &key)).await?
        };
        let (content_id, salt, plaintext_size) = match encrypted {
            Ok(result) => result,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
        };

        self.store
            .put_file(content_id, &staged, salt, Some(plaintext_size))
            .await?;
        info!(
            "Encrypted {} ({} bytes) as {}",
            path.as_ref().display(),
            plaintext_size,
            content_id
        );

        self.replicate(&session, content_id, plaintext_size).await;
        Ok(MagnetLink::new(content_id, key))
    }

    /// Push a stored object to the first `fanout` peers
    ///
    /// Returns the number of peers that accepted it. Every failure is
    /// logged and absorbed here.
    async fn replicate(&self, session: &Session, content_id: ContentId, size: u64) -> usize {
        let targets: Vec<PeerRecord> = self
            .directory
            .read()
            .await
            .snapshot()
            .into_iter()
            .take(self.config.dht.fanout)
            .collect();

        if targets.is_empty() {
            info!("No known peers; {} is stored locally only", content_id);
            return 0;
        }

        let salt = match self.store.entry(&content_id).await {
            Some(entry) => entry.salt,
            None => {
                warn!("{} left the local store before replication", content_id);
                return 0;
            }
        };

        // Every target streams from the same artifact file
        let artifact = self.store.artifact_path(&content_id);
        let results = join_all(targets.iter().map(|peer| {
            self.client.store(
                &peer.peer_id,
                content_id,
                salt,
                &session.address,
                Some(size),
                &artifact,
            )
        }))
        .await;

        let mut replicas = 0;
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {
                    replicas += 1;
                    let mut directory = self.directory.write().await;
                    directory.touch(&peer.peer_id);
                    directory.mark_holds(&peer.peer_id, content_id);
                }
                Err(e) => {
                    warn!("Replication to {} failed: {}", peer.peer_id, e);
                    self.note_failure(&peer.peer_id, &e).await;
                }
            }
        }

        if replicas == 0 {
            warn!("{} was not replicated to any peer", content_id);
        } else {
            info!("Replicated {} to {}/{} peers", content_id, replicas, targets.len());
        }
        replicas
    }

    /// Retrieve and decrypt the file behind a magnet link into `output`
    ///
    /// Checks the local store first, then asks every known peer in
    /// directory order, then the peers they suggested (one hop only, at
    /// most `dht.max_peers` of them). Returns the number of plaintext
    /// bytes written.
    ///
    /// Fails with `ObjectTooLarge` rather than `NotFound` when a peer
    /// holds the object but it exceeds `dht.max_object_bytes`.
    pub async fn download(&self, link: &MagnetLink, output: impl AsRef<Path>) -> Result<u64> {
        let session = self.session().await?;
        let content_id = link.content_id;
        let output = output.as_ref().to_path_buf();

        if self.store.contains(&content_id).await {
            let artifact = self.store.artifact_path(&content_id);
            let key = link.key.clone();
            let target = output.clone();
            let local = tokio::task::spawn_blocking(move || {
                let file = File::open(&artifact)?;
                decrypt_to_file(BufReader::new(file), &target, &key)
            })
            .await?;

            match local {
                Ok(written) => {
                    info!("Served {} from the local store", content_id);
                    return Ok(written);
                }
                // Removed between the check and the read
                Err(NodeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let candidates: Vec<String> = self
            .directory
            .read()
            .await
            .snapshot()
            .into_iter()
            .map(|p| p.peer_id)
            .collect();

        let mut tried: HashSet<String> = HashSet::new();
        tried.insert(session.address.clone());
        let mut hints = Vec::new();
        let mut too_large = None;

        for address in candidates {
            if !tried.insert(address.clone()) {
                continue;
            }
            match self.find_on(&address, content_id).await {
                FindOutcome::Found { staged } => {
                    return self.finish_download(&address, content_id, staged, link, output).await;
                }
                FindOutcome::NotFound { hints: more } => {
                    collect_hints(&mut hints, more, self.config.dht.max_peers)
                }
                FindOutcome::TooLarge(e) => too_large = Some(e),
                FindOutcome::Failed => {}
            }
        }

        // Suggestions from the first round are tried once; theirs are not followed
        for address in hints {
            if !tried.insert(address.clone()) {
                continue;
            }
            match self.find_on(&address, content_id).await {
                FindOutcome::Found { staged } => {
                    return self.finish_download(&address, content_id, staged, link, output).await;
                }
                FindOutcome::TooLarge(e) => too_large = Some(e),
                FindOutcome::NotFound { .. } | FindOutcome::Failed => {}
            }
        }

        if let Some(e) = too_large {
            warn!("{} is held by a peer but refused: {}", content_id, e);
            return Err(e);
        }

        warn!("{} not found on {} peers", content_id, tried.len() - 1);
        Err(NodeError::NotFound(content_id))
    }

    /// Ask one peer for an object, receiving it into a staging file
    async fn find_on(&self, address: &str, content_id: ContentId) -> FindOutcome {
        let staged = self.store.staging_path();
        match self.client.find(address, content_id, &staged).await {
            Ok(FindReply::Found {
                content_id: received,
                ..
            }) if received == content_id => {
                self.directory.write().await.touch(address);
                FindOutcome::Found { staged }
            }
            Ok(FindReply::Found { .. }) => {
                let _ = tokio::fs::remove_file(&staged).await;
                warn!("Peer {} returned data that does not match {}", address, content_id);
                FindOutcome::Failed
            }
            Ok(FindReply::NotFound { peers }) => {
                self.directory.write().await.touch(address);
                debug!("{} not on {} ({} hints)", content_id, address, peers.len());
                FindOutcome::NotFound { hints: peers }
            }
            Err(e @ NodeError::ObjectTooLarge { .. }) => {
                self.directory.write().await.touch(address);
                warn!("Peer {} holds {} but: {}", address, content_id, e);
                FindOutcome::TooLarge(e)
            }
            Err(e) => {
                self.note_failure(address, &e).await;
                FindOutcome::Failed
            }
        }
    }

    /// Decrypt a verified staged artifact into `output`, then drop it
    async fn finish_download(
        &self,
        address: &str,
        content_id: ContentId,
        staged: PathBuf,
        link: &MagnetLink,
        output: PathBuf,
    ) -> Result<u64> {
        let key = link.key.clone();
        let source = staged.clone();
        let decrypted = tokio::task::spawn_blocking(move || {
            let file = File::open(&source)?;
            decrypt_to_file(BufReader::new(file), &output, &key)
        })
        .await;

        let _ = tokio::fs::remove_file(&staged).await;
        let written = decrypted??;

        info!("Downloaded {} from {} ({} bytes)", content_id, address, written);
        Ok(written)
    }
}

/// Append not-yet-seen hints, keeping at most `cap` in total
fn collect_hints(hints: &mut Vec<String>, more: Vec<String>, cap: usize) {
    for hint in more {
        if hints.len() >= cap {
            break;
        }
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }
}

/// Size of the artifact produced from `plaintext_len` bytes (IV plus
/// PKCS#7-padded ciphertext)
fn artifact_size(plaintext_len: u64) -> u64 {
    let block = IV_SIZE as u64;
    block + (plaintext_len / block + 1) * block
}

/// Accept connections until shutdown, then drain handlers
async fn accept_loop(
    listener: Box<dyn Listener>,
    ctx: HandlerContext,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ctx = ctx.clone();
                    handlers.spawn(async move {
                        serve_connection(&ctx, stream, &remote).await;
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = finished {
                    warn!("Connection handler failed: {}", e);
                }
            }
        }
    }

    drop(listener);

    let pending = handlers.len();
    if pending > 0 {
        debug!("Waiting for {} in-flight handlers", pending);
        let drained = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} handlers after {:?} grace period", handlers.len(), grace);
            handlers.abort_all();
        }
    }
}

/// Encrypt `source` into `staged`, hashing the blob as it is written
fn encrypt_to_file(
    source: &Path,
    staged: &Path,
    key: &SymmetricKey,
) -> Result<(ContentId, Salt, u64)> {
    let input = BufReader::new(File::open(source)?);
    let output = BufWriter::new(File::create(staged)?);

    let mut writer = ContentHasher::new(Salt::generate()).wrap(output);
    let (_iv, plaintext_size) = encrypt_stream(input, &mut writer, key)?;
    let (output, content_id, salt) = writer.finish();

    let file = output.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok((content_id, salt, plaintext_size))
}

/// Decrypt a blob into `output` via a `.part` file renamed on success
fn decrypt_to_file<R: Read>(reader: R, output: &Path, key: &SymmetricKey) -> Result<u64> {
    let mut part = output.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    let result = (|| {
        let mut writer = BufWriter::new(File::create(&part)?);
        let written = decrypt_stream(reader, &mut writer, key)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok::<_, NodeError>(written)
    })();

    match result {
        Ok(written) => {
            std::fs::rename(&part, output)?;
            Ok(written)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            Err(e)
        }
    }
}
