use std::path::PathBuf;

use uuid::Uuid;

/// Notifications the client core emits for its UI collaborator. The core
/// never touches the console; whatever renders these decides how they look.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The hub acknowledged us and assigned a peer id.
    Connected { id: String },
    Chat {
        sender: String,
        content: String,
        /// True for directed messages, false for broadcast.
        direct: bool,
    },
    /// Someone offered us a file; answer with accept/reject by ordinal.
    FileOffer {
        ordinal: u32,
        sender: String,
        file_name: String,
        size: u64,
    },
    /// An offer sat unanswered too long and was dropped.
    OfferExpired { ordinal: u32, file_name: String },
    /// The recipient consented; chunks are flowing.
    UploadStarted { transfer_id: Uuid, file_name: String },
    UploadFinished {
        transfer_id: Uuid,
        file_name: String,
        bytes: u64,
    },
    UploadFailed {
        transfer_id: Uuid,
        file_name: String,
        reason: String,
    },
    /// No confirmation arrived in time; the upload was dropped locally.
    UploadExpired { transfer_id: Uuid, file_name: String },
    DownloadCompleted {
        transfer_id: Uuid,
        file_name: String,
        path: PathBuf,
        bytes: u64,
    },
    DownloadFailed {
        transfer_id: Uuid,
        file_name: String,
        reason: String,
    },
    /// ERROR frame from the hub.
    ServerError { description: String },
    /// The link to the hub is gone; the client is finished.
    Disconnected,
}
