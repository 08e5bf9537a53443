//! End-to-end client-core tests against a real hub on loopback TCP:
//! consent-gated transfers arrive byte-identical, rejections leave no file
//! behind, and chat routes through rewritten sender ids.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use courier_client::{Client, ClientConfig, ClientEvent};
use courier_server::hub::Hub;

async fn spawn_hub() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Hub::new();
    tokio::spawn(async move { hub.run(listener).await });
    addr
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courier_e2e_{tag}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

async fn connect(addr: SocketAddr, name: &str, storage: PathBuf) -> (Client, UnboundedReceiver<ClientEvent>, String) {
    let mut config = ClientConfig::new(addr.to_string(), name);
    config.storage_dir = storage;
    let (client, mut events) = Client::connect(config).await.unwrap();
    let id = wait_for(&mut events, |e| match e {
        ClientEvent::Connected { id } => Some(id),
        _ => None,
    })
    .await;
    (client, events, id)
}

async fn wait_for<T>(
    events: &mut UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed");
        if let Some(value) = pick(event) {
            return value;
        }
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn transfer_roundtrip(size: usize) {
    let addr = spawn_hub().await;
    let tag = format!("rt_{size}");
    let a_store = scratch_dir(&format!("{tag}_a"));
    let b_store = scratch_dir(&format!("{tag}_b"));

    let (a, mut a_events, _a_id) = connect(addr, "alice", a_store.clone()).await;
    let (b, mut b_events, b_id) = connect(addr, "bob", b_store.clone()).await;

    let input = a_store.join("input.bin");
    let data = patterned(size);
    tokio::fs::write(&input, &data).await.unwrap();

    a.send_file(&input, &b_id).await.unwrap();

    let ordinal = wait_for(&mut b_events, |e| match e {
        ClientEvent::FileOffer { ordinal, file_name, size: offered, .. } => {
            assert_eq!(file_name, "input.bin");
            assert_eq!(offered, size as u64);
            Some(ordinal)
        }
        _ => None,
    })
    .await;

    b.accept_download(ordinal).await.unwrap();

    let sent = wait_for(&mut a_events, |e| match e {
        ClientEvent::UploadFinished { bytes, .. } => Some(bytes),
        ClientEvent::UploadFailed { reason, .. } => panic!("upload failed: {reason}"),
        _ => None,
    })
    .await;
    assert_eq!(sent, size as u64);

    let (path, received) = wait_for(&mut b_events, |e| match e {
        ClientEvent::DownloadCompleted { path, bytes, .. } => Some((path, bytes)),
        ClientEvent::DownloadFailed { reason, .. } => panic!("download failed: {reason}"),
        _ => None,
    })
    .await;
    assert_eq!(received, size as u64);

    // The recipient's copy is byte-identical to the source.
    let output = tokio::fs::read(&path).await.unwrap();
    assert_eq!(output, data);
    assert!(path.starts_with(&b_store));

    let _ = tokio::fs::remove_dir_all(&a_store).await;
    let _ = tokio::fs::remove_dir_all(&b_store).await;
}

#[tokio::test]
async fn transfer_small_file() {
    transfer_roundtrip(10).await;
}

#[tokio::test]
async fn transfer_multi_chunk_file() {
    transfer_roundtrip(20000).await; // 8192 + 8192 + 3616
}

#[tokio::test]
async fn transfer_exact_chunk_boundary() {
    // Exact multiple of the chunk size: the last chunk is full-sized,
    // never zero-length.
    transfer_roundtrip(8192 * 2).await;
}

#[tokio::test]
async fn transfer_empty_file() {
    transfer_roundtrip(0).await;
}

#[tokio::test]
async fn rejected_offer_fails_upload_and_leaves_no_file() {
    let addr = spawn_hub().await;
    let a_store = scratch_dir("rej_a");
    let b_store = scratch_dir("rej_b");

    let (a, mut a_events, _) = connect(addr, "alice", a_store.clone()).await;
    let (b, mut b_events, b_id) = connect(addr, "bob", b_store.clone()).await;

    let input = a_store.join("secret.bin");
    tokio::fs::write(&input, patterned(4096)).await.unwrap();
    a.send_file(&input, &b_id).await.unwrap();

    let ordinal = wait_for(&mut b_events, |e| match e {
        ClientEvent::FileOffer { ordinal, .. } => Some(ordinal),
        _ => None,
    })
    .await;
    b.reject_download(ordinal).await.unwrap();

    let reason = wait_for(&mut a_events, |e| match e {
        ClientEvent::UploadFailed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.contains("rejected"));

    // Nothing was ever written on the recipient side.
    let mut entries = tokio::fs::read_dir(&b_store).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());

    let _ = tokio::fs::remove_dir_all(&a_store).await;
    let _ = tokio::fs::remove_dir_all(&b_store).await;
}

#[tokio::test]
async fn chat_routes_with_authoritative_sender() {
    let addr = spawn_hub().await;
    let (a, _a_events, a_id) = connect(addr, "alice", scratch_dir("chat_a")).await;
    let (_b, mut b_events, b_id) = connect(addr, "bob", scratch_dir("chat_b")).await;

    a.send_chat(None, "hello everyone").await.unwrap();
    wait_for(&mut b_events, |e| match e {
        ClientEvent::Chat {
            sender,
            content,
            direct,
        } => {
            assert_eq!(sender, a_id);
            assert_eq!(content, "hello everyone");
            assert!(!direct);
            Some(())
        }
        _ => None,
    })
    .await;

    a.send_chat(Some(&b_id), "just for you").await.unwrap();
    wait_for(&mut b_events, |e| match e {
        ClientEvent::Chat {
            content, direct, ..
        } => {
            assert_eq!(content, "just for you");
            assert!(direct);
            Some(())
        }
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn sender_disconnect_deletes_partial_download() {
    let addr = spawn_hub().await;
    let a_store = scratch_dir("gone_a");
    let b_store = scratch_dir("gone_b");

    let (a, mut a_events, _) = connect(addr, "alice", a_store.clone()).await;
    let (b, mut b_events, b_id) = connect(addr, "bob", b_store.clone()).await;

    let input = a_store.join("big.bin");
    tokio::fs::write(&input, patterned(20000)).await.unwrap();
    a.send_file(&input, &b_id).await.unwrap();

    let ordinal = wait_for(&mut b_events, |e| match e {
        ClientEvent::FileOffer { ordinal, .. } => Some(ordinal),
        _ => None,
    })
    .await;
    let dest = b.accept_download(ordinal).await.unwrap();

    // Let at least the offer handshake finish, then yank the sender. The
    // hub aborts the transfer and the recipient deletes the partial file.
    wait_for(&mut a_events, |e| match e {
        ClientEvent::UploadStarted { .. } => Some(()),
        _ => None,
    })
    .await;
    a.disconnect("crash").await;

    wait_for(&mut b_events, |e| match e {
        ClientEvent::DownloadCompleted { .. } => {
            // The race is real: the whole 20000 bytes may have landed
            // before the disconnect was processed. That is a pass too.
            Some(())
        }
        ClientEvent::DownloadFailed { .. } => Some(()),
        _ => None,
    })
    .await;

    // Either the file completed intact or it is gone; a partial must not
    // survive.
    if tokio::fs::try_exists(&dest).await.unwrap() {
        let len = tokio::fs::metadata(&dest).await.unwrap().len();
        assert_eq!(len, 20000);
    }

    let _ = tokio::fs::remove_dir_all(&a_store).await;
    let _ = tokio::fs::remove_dir_all(&b_store).await;
}
