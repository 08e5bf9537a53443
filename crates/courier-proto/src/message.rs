use bytes::Bytes;

/// Sender id stamped on every hub-originated frame. Peers compare
/// case-insensitively via [`is_server_sender`].
pub const SERVER_SENDER: &str = "SERVER";

/// True if a sender id names the hub itself rather than a peer.
pub fn is_server_sender(sender: &str) -> bool {
    sender.eq_ignore_ascii_case(SERVER_SENDER)
}

/// The closed set of messages exchanged between peers and the hub.
///
/// `sender` carries the 8-hex-char peer id (or [`SERVER_SENDER`]); an empty
/// `target` means broadcast for the kinds that support it. The hub rewrites
/// the sender of every inbound frame to the authoritative id, so peers cannot
/// spoof each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Public broadcast (empty target) or directed unicast chat line.
    Chat {
        sender: String,
        target: String,
        content: String,
    },
    /// Announces a file transfer; no payload flows until the recipient
    /// answers with `DownloadAccept`.
    FileStart {
        sender: String,
        target: String,
        transfer_id: String,
        file_name: String,
        file_size: u64,
    },
    /// One chunk of file payload.
    FileData {
        sender: String,
        target: String,
        transfer_id: String,
        seq: u32,
        data: Bytes,
    },
    /// Terminates a transfer, successfully or not.
    FileEnd {
        sender: String,
        target: String,
        transfer_id: String,
        success: bool,
        error: String,
    },
    /// Per-chunk receipt. Carries no flow-control semantics.
    Ack {
        sender: String,
        target: String,
        transfer_id: String,
        seq: u32,
    },
    Error {
        sender: String,
        target: String,
        description: String,
    },
    /// First frame a peer sends; carries its display name.
    ClientConnect { sender: String, client_name: String },
    ClientDisconnect { sender: String, reason: String },
    /// Hub's reply to `ClientConnect`, echoing the assigned peer id.
    ClientIdResponse { sender: String, client_id: String },
    DownloadAccept { sender: String, transfer_id: String },
    DownloadReject { sender: String, transfer_id: String },
    /// Hub's signal to the original sender that payload may flow.
    UploadConfirmed { sender: String, transfer_id: String },
}

impl Message {
    /// The one-byte kind tag that leads the encoded payload.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Chat { .. } => 0x01,
            Message::FileStart { .. } => 0x02,
            Message::FileData { .. } => 0x03,
            Message::FileEnd { .. } => 0x04,
            Message::Ack { .. } => 0x05,
            Message::Error { .. } => 0x06,
            Message::ClientConnect { .. } => 0x07,
            Message::ClientDisconnect { .. } => 0x08,
            Message::ClientIdResponse { .. } => 0x09,
            Message::DownloadAccept { .. } => 0x0A,
            Message::DownloadReject { .. } => 0x0B,
            Message::UploadConfirmed { .. } => 0x0C,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Chat { .. } => "CHAT",
            Message::FileStart { .. } => "FILE_START",
            Message::FileData { .. } => "FILE_DATA",
            Message::FileEnd { .. } => "FILE_END",
            Message::Ack { .. } => "ACK",
            Message::Error { .. } => "ERROR",
            Message::ClientConnect { .. } => "CLIENT_CONNECT",
            Message::ClientDisconnect { .. } => "CLIENT_DISCONNECT",
            Message::ClientIdResponse { .. } => "CLIENT_ID_RESPONSE",
            Message::DownloadAccept { .. } => "DOWNLOAD_ACCEPT",
            Message::DownloadReject { .. } => "DOWNLOAD_REJECT",
            Message::UploadConfirmed { .. } => "UPLOAD_CONFIRMED",
        }
    }

    /// Overwrites the sender field. The hub calls this on every inbound frame
    /// before routing; the value the peer supplied is discarded.
    pub fn set_sender(&mut self, id: &str) {
        match self {
            Message::Chat { sender, .. }
            | Message::FileStart { sender, .. }
            | Message::FileData { sender, .. }
            | Message::FileEnd { sender, .. }
            | Message::Ack { sender, .. }
            | Message::Error { sender, .. }
            | Message::ClientConnect { sender, .. }
            | Message::ClientDisconnect { sender, .. }
            | Message::ClientIdResponse { sender, .. }
            | Message::DownloadAccept { sender, .. }
            | Message::DownloadReject { sender, .. }
            | Message::UploadConfirmed { sender, .. } => {
                id.clone_into(sender);
            }
        }
    }
}
