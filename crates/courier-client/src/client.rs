//! The peer client core: connection management, the outbound transfer
//! driver, and the inbound transfer assembler. All user-visible activity is
//! surfaced as [`ClientEvent`]s; rendering is the caller's business.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_net::{Connection, NetError};
use courier_proto::{MAX_FILE_SIZE, Message};

use crate::downloads::{DownloadOffer, DownloadProgress, Downloads};
use crate::events::ClientEvent;
use crate::storage::StorageDir;
use crate::uploads::{self, PendingUpload};

/// Cadence of the local pending-upload / pending-offer expiry sweep.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Hook for vetting outbound files before FILE_START goes out. The size
/// ceiling is enforced separately; this is where an allow-list or a
/// compression collaborator would attach.
pub trait UploadPolicy: Send + Sync {
    fn check(&self, path: &Path, size: u64) -> Result<(), String>;
}

/// Default policy: anything goes.
pub struct AllowAll;

impl UploadPolicy for AllowAll {
    fn check(&self, _path: &Path, _size: u64) -> Result<(), String> {
        Ok(())
    }
}

pub struct ClientConfig {
    pub server_addr: String,
    pub client_name: String,
    pub storage_dir: PathBuf,
    pub policy: Arc<dyn UploadPolicy>,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            client_name: client_name.into(),
            storage_dir: PathBuf::from("storage"),
            policy: Arc::new(AllowAll),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("refused by upload policy: {0}")]
    PolicyDenied(String),
    #[error("no pending download #{0}")]
    UnknownOrdinal(u32),
    #[error("transfer cancelled")]
    Cancelled,
}

struct ActiveUpload {
    file_name: String,
    cancel: CancellationToken,
}

/// Handle to one hub connection. Cheap to clone; all clones share the
/// underlying endpoint and tables.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    conn: Arc<Connection>,
    policy: Arc<dyn UploadPolicy>,
    storage: StorageDir,
    /// Hub-assigned peer id, empty until CLIENT_ID_RESPONSE arrives.
    id: StdRwLock<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
    uploads: StdMutex<HashMap<Uuid, PendingUpload>>,
    active_uploads: StdMutex<HashMap<Uuid, ActiveUpload>>,
    downloads: Mutex<Downloads>,
}

impl Client {
    /// Connects to the hub, announces the display name, and starts the
    /// read and expiry tasks. Events arrive on the returned receiver.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        stream.set_nodelay(true)?;
        let conn = Arc::new(Connection::new(stream));
        let storage = StorageDir::create(config.storage_dir).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let client = Client {
            inner: Arc::new(ClientInner {
                conn,
                policy: config.policy,
                storage,
                id: StdRwLock::new(String::new()),
                events: events_tx,
                uploads: StdMutex::new(HashMap::new()),
                active_uploads: StdMutex::new(HashMap::new()),
                downloads: Mutex::new(Downloads::default()),
            }),
        };

        client
            .inner
            .conn
            .send(&Message::ClientConnect {
                sender: String::new(),
                client_name: config.client_name,
            })
            .await?;

        let reader = client.clone();
        tokio::spawn(async move { reader.read_loop().await });
        let sweeper = client.clone();
        tokio::spawn(async move { sweeper.expiry_loop().await });

        Ok((client, events_rx))
    }

    /// The hub-assigned peer id; empty until the hub has answered.
    pub fn id(&self) -> String {
        self.inner.id.read().unwrap().clone()
    }

    /// Broadcast (no target) or directed chat.
    pub async fn send_chat(&self, target: Option<&str>, content: &str) -> Result<(), ClientError> {
        self.inner
            .conn
            .send(&Message::Chat {
                sender: self.id(),
                target: target.unwrap_or_default().to_owned(),
                content: content.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// Announces a file to `target` and waits (asynchronously) for consent.
    /// Chunks only start flowing once the hub sends UPLOAD_CONFIRMED.
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        target: &str,
    ) -> Result<Uuid, ClientError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(ClientError::NotAFile(path));
        }
        let size = meta.len();
        if size > MAX_FILE_SIZE {
            return Err(ClientError::TooLarge {
                size,
                limit: MAX_FILE_SIZE,
            });
        }
        self.inner
            .policy
            .check(&path, size)
            .map_err(ClientError::PolicyDenied)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::NotAFile(path.clone()))?;

        let transfer_id = Uuid::new_v4();
        self.inner.uploads.lock().unwrap().insert(
            transfer_id,
            PendingUpload {
                path,
                file_name: file_name.clone(),
                target: target.to_owned(),
                size,
                created_at: Instant::now(),
            },
        );

        self.inner
            .conn
            .send(&Message::FileStart {
                sender: self.id(),
                target: target.to_owned(),
                transfer_id: transfer_id.to_string(),
                file_name,
                file_size: size,
            })
            .await?;
        info!("offered {size}-byte file to {target} as transfer {transfer_id}");
        Ok(transfer_id)
    }

    /// Consents to a queued offer. Opens a collision-free destination under
    /// the storage directory before telling the hub.
    pub async fn accept_download(&self, ordinal: u32) -> Result<PathBuf, ClientError> {
        let mut downloads = self.inner.downloads.lock().await;
        let offer = downloads
            .take_pending(ordinal)
            .ok_or(ClientError::UnknownOrdinal(ordinal))?;
        let transfer_id = offer.transfer_id;
        let path = self.inner.storage.unique_destination(&offer.file_name).await?;
        downloads.activate(offer, path.clone()).await?;
        drop(downloads);

        self.inner
            .conn
            .send(&Message::DownloadAccept {
                sender: self.id(),
                transfer_id: transfer_id.to_string(),
            })
            .await?;
        info!("accepted transfer {transfer_id} into {}", path.display());
        Ok(path)
    }

    /// Declines a queued offer. The file is never opened.
    pub async fn reject_download(&self, ordinal: u32) -> Result<(), ClientError> {
        let offer = self
            .inner
            .downloads
            .lock()
            .await
            .take_pending(ordinal)
            .ok_or(ClientError::UnknownOrdinal(ordinal))?;
        self.inner
            .conn
            .send(&Message::DownloadReject {
                sender: self.id(),
                transfer_id: offer.transfer_id.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn pending_downloads(&self) -> Vec<DownloadOffer> {
        self.inner.downloads.lock().await.pending_offers()
    }

    pub async fn download_progress(&self) -> Vec<DownloadProgress> {
        self.inner.downloads.lock().await.progress()
    }

    /// Uploads currently streaming chunks.
    pub fn active_uploads(&self) -> Vec<(Uuid, String)> {
        self.inner
            .active_uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(id, u)| (*id, u.file_name.clone()))
            .collect()
    }

    /// Says goodbye and closes the endpoint.
    pub async fn disconnect(&self, reason: &str) {
        let _ = self
            .inner
            .conn
            .send(&Message::ClientDisconnect {
                sender: self.id(),
                reason: reason.to_owned(),
            })
            .await;
        self.inner.conn.close();
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn read_loop(self) {
        loop {
            match self.inner.conn.recv().await {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("connection error: {e}");
                    break;
                }
            }
        }
        self.inner.conn.close();

        // Tear down whatever the link's loss leaves dangling.
        let actives: Vec<ActiveUpload> = {
            let mut map = self.inner.active_uploads.lock().unwrap();
            map.drain().map(|(_, u)| u).collect()
        };
        for upload in actives {
            upload.cancel.cancel();
        }
        let aborted = self.inner.downloads.lock().await.abort_all().await;
        for offer in aborted {
            self.emit(ClientEvent::DownloadFailed {
                transfer_id: offer.transfer_id,
                file_name: offer.file_name,
                reason: "connection lost".into(),
            });
        }
        self.emit(ClientEvent::Disconnected);
    }

    async fn handle_message(&self, msg: Message) {
        match msg {
            Message::ClientIdResponse { client_id, .. } => {
                *self.inner.id.write().unwrap() = client_id.clone();
                info!("hub assigned id {client_id}");
                self.emit(ClientEvent::Connected { id: client_id });
            }

            Message::Chat {
                sender,
                target,
                content,
            } => {
                self.emit(ClientEvent::Chat {
                    sender,
                    content,
                    direct: !target.is_empty(),
                });
            }

            Message::FileStart {
                sender,
                transfer_id,
                file_name,
                file_size,
                ..
            } => {
                let Some(tid) = parse_transfer_id(&transfer_id) else {
                    return;
                };
                let offer = self
                    .inner
                    .downloads
                    .lock()
                    .await
                    .queue(tid, sender, file_name, file_size);
                self.emit(ClientEvent::FileOffer {
                    ordinal: offer.ordinal,
                    sender: offer.sender,
                    file_name: offer.file_name,
                    size: offer.size,
                });
            }

            Message::UploadConfirmed { transfer_id, .. } => {
                let Some(tid) = parse_transfer_id(&transfer_id) else {
                    return;
                };
                self.start_upload(tid);
            }

            Message::FileData {
                transfer_id,
                seq,
                data,
                ..
            } => {
                let Some(tid) = parse_transfer_id(&transfer_id) else {
                    return;
                };
                let result = self
                    .inner
                    .downloads
                    .lock()
                    .await
                    .write_chunk(tid, seq, &data)
                    .await;
                if let Err(e) = result {
                    self.fail_download(tid, format!("write failed: {e}")).await;
                }
            }

            Message::FileEnd {
                transfer_id,
                success,
                error,
                ..
            } => {
                let Some(tid) = parse_transfer_id(&transfer_id) else {
                    return;
                };
                self.finish_transfer(tid, success, error).await;
            }

            Message::Ack {
                transfer_id, seq, ..
            } => {
                debug!("hub acked transfer {transfer_id} seq {seq}");
            }

            Message::Error { description, .. } => {
                warn!("hub reported: {description}");
                self.emit(ClientEvent::ServerError { description });
            }

            other => {
                debug!("ignoring unexpected {} frame", other.kind_name());
            }
        }
    }

    /// Consent arrived: move the pending upload to active and start the
    /// chunk driver.
    fn start_upload(&self, tid: Uuid) {
        let Some(pending) = self.inner.uploads.lock().unwrap().remove(&tid) else {
            warn!("confirmation for unknown upload {tid}");
            return;
        };
        let cancel = CancellationToken::new();
        self.inner.active_uploads.lock().unwrap().insert(
            tid,
            ActiveUpload {
                file_name: pending.file_name.clone(),
                cancel: cancel.clone(),
            },
        );
        self.emit(ClientEvent::UploadStarted {
            transfer_id: tid,
            file_name: pending.file_name.clone(),
        });

        let client = self.clone();
        tokio::spawn(async move { client.drive_upload(tid, pending, cancel).await });
    }

    async fn drive_upload(self, tid: Uuid, job: PendingUpload, cancel: CancellationToken) {
        let own_id = self.id();
        let result = uploads::stream_chunks(
            &self.inner.conn,
            &own_id,
            &job.target,
            tid,
            &job.path,
            job.size,
            &cancel,
        )
        .await;
        self.inner.active_uploads.lock().unwrap().remove(&tid);

        match result {
            Ok(()) => self.emit(ClientEvent::UploadFinished {
                transfer_id: tid,
                file_name: job.file_name,
                bytes: job.size,
            }),
            // Cancelled means the hub already ended the transfer; whoever
            // cancelled has emitted the event.
            Err(ClientError::Cancelled) => debug!("upload {tid} cancelled"),
            Err(e) => {
                let _ = self
                    .inner
                    .conn
                    .send(&Message::FileEnd {
                        sender: own_id,
                        target: job.target.clone(),
                        transfer_id: tid.to_string(),
                        success: false,
                        error: e.to_string(),
                    })
                    .await;
                self.emit(ClientEvent::UploadFailed {
                    transfer_id: tid,
                    file_name: job.file_name,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// FILE_END routing: the id may belong to an inbound download, one of
    /// our uploads, or an offer we never answered.
    async fn finish_transfer(&self, tid: Uuid, success: bool, error: String) {
        if let Some(done) = self.inner.downloads.lock().await.finish(tid, success).await {
            if success {
                self.emit(ClientEvent::DownloadCompleted {
                    transfer_id: tid,
                    file_name: done.offer.file_name,
                    path: done.path,
                    bytes: done.bytes,
                });
            } else {
                self.emit(ClientEvent::DownloadFailed {
                    transfer_id: tid,
                    file_name: done.offer.file_name,
                    reason: reason_or(error, "aborted by sender"),
                });
            }
            return;
        }

        if let Some(pending) = self.inner.uploads.lock().unwrap().remove(&tid) {
            self.emit(ClientEvent::UploadFailed {
                transfer_id: tid,
                file_name: pending.file_name,
                reason: reason_or(error, "transfer ended"),
            });
            return;
        }

        let active = self.inner.active_uploads.lock().unwrap().remove(&tid);
        if let Some(active) = active {
            active.cancel.cancel();
            self.emit(ClientEvent::UploadFailed {
                transfer_id: tid,
                file_name: active.file_name,
                reason: reason_or(error, "transfer ended"),
            });
            return;
        }

        if let Some(offer) = self
            .inner
            .downloads
            .lock()
            .await
            .drop_pending_by_transfer(tid)
        {
            self.emit(ClientEvent::OfferExpired {
                ordinal: offer.ordinal,
                file_name: offer.file_name,
            });
            return;
        }

        debug!("FILE_END for unknown transfer {tid}");
    }

    /// A local write failure aborts the transfer: partial file deleted,
    /// FILE_END(success=false) reported back through the hub.
    async fn fail_download(&self, tid: Uuid, reason: String) {
        let Some(done) = self.inner.downloads.lock().await.finish(tid, false).await else {
            return;
        };
        let _ = self
            .inner
            .conn
            .send(&Message::FileEnd {
                sender: self.id(),
                target: done.offer.sender.clone(),
                transfer_id: tid.to_string(),
                success: false,
                error: reason.clone(),
            })
            .await;
        self.emit(ClientEvent::DownloadFailed {
            transfer_id: tid,
            file_name: done.offer.file_name,
            reason,
        });
    }

    async fn expiry_loop(self) {
        let cancel = self.inner.conn.cancel_token();
        let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let now = Instant::now();

            let expired: Vec<(Uuid, PendingUpload)> = {
                let mut uploads = self.inner.uploads.lock().unwrap();
                let ids: Vec<Uuid> = uploads
                    .iter()
                    .filter(|(_, u)| u.expired(now))
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| uploads.remove(&id).map(|u| (id, u)))
                    .collect()
            };
            for (tid, upload) in expired {
                warn!("upload {tid} never confirmed, dropping");
                self.emit(ClientEvent::UploadExpired {
                    transfer_id: tid,
                    file_name: upload.file_name,
                });
            }

            let stale = self.inner.downloads.lock().await.sweep(now);
            for offer in stale {
                self.emit(ClientEvent::OfferExpired {
                    ordinal: offer.ordinal,
                    file_name: offer.file_name,
                });
            }
        }
    }
}

fn parse_transfer_id(raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(tid) => Some(tid),
        Err(_) => {
            warn!("unparseable transfer id {raw:?}");
            None
        }
    }
}

fn reason_or(error: String, fallback: &str) -> String {
    if error.is_empty() {
        fallback.to_owned()
    } else {
        error
    }
}
