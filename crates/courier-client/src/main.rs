//! Minimal line-oriented front end over the client core. Commands:
//!
//! ```text
//! <text>              broadcast chat
//! /msg <peer> <text>  directed chat
//! /send <peer> <path> offer a file
//! /accept <n>         accept pending download n
//! /reject <n>         reject pending download n
//! /list               show pending offers and active transfers
//! /quit               leave
//! ```

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use courier_client::{Client, ClientConfig, ClientEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_client=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let server_addr = args
        .next()
        .or_else(|| std::env::var("COURIER_SERVER").ok())
        .unwrap_or_else(|| "127.0.0.1:8888".into());
    let client_name = args
        .next()
        .or_else(|| std::env::var("COURIER_NAME").ok())
        .unwrap_or_else(|| "anonymous".into());
    let storage_dir: PathBuf = std::env::var("COURIER_STORAGE_DIR")
        .unwrap_or_else(|_| "storage".into())
        .into();

    let mut config = ClientConfig::new(server_addr.clone(), client_name);
    config.storage_dir = storage_dir;

    let (client, mut events) = Client::connect(config).await?;
    println!("connected to {server_addr}");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => break,
                Some(ClientEvent::Disconnected) => {
                    println!("* connection to hub lost");
                    break;
                }
                Some(event) => render(event),
            },
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => {
                    if !run_command(&client, line.trim()).await {
                        break;
                    }
                }
            },
        }
    }

    client.disconnect("quit").await;
    Ok(())
}

fn render(event: ClientEvent) {
    match event {
        ClientEvent::Connected { id } => println!("* your peer id is {id}"),
        ClientEvent::Chat {
            sender,
            content,
            direct,
        } => {
            if direct {
                println!("[{sender} -> you] {content}");
            } else {
                println!("[{sender}] {content}");
            }
        }
        ClientEvent::FileOffer {
            ordinal,
            sender,
            file_name,
            size,
        } => println!(
            "* {sender} offers {file_name:?} ({size} bytes) — /accept {ordinal} or /reject {ordinal}"
        ),
        ClientEvent::OfferExpired { ordinal, file_name } => {
            println!("* offer #{ordinal} ({file_name:?}) expired")
        }
        ClientEvent::UploadStarted { file_name, .. } => {
            println!("* sending {file_name:?}...")
        }
        ClientEvent::UploadFinished {
            file_name, bytes, ..
        } => println!("* sent {file_name:?} ({bytes} bytes)"),
        ClientEvent::UploadFailed {
            file_name, reason, ..
        } => println!("* sending {file_name:?} failed: {reason}"),
        ClientEvent::UploadExpired { file_name, .. } => {
            println!("* offer of {file_name:?} was never answered, dropped")
        }
        ClientEvent::DownloadCompleted {
            file_name,
            path,
            bytes,
            ..
        } => println!("* received {file_name:?} ({bytes} bytes) -> {}", path.display()),
        ClientEvent::DownloadFailed {
            file_name, reason, ..
        } => println!("* download of {file_name:?} failed: {reason}"),
        ClientEvent::ServerError { description } => println!("* hub: {description}"),
        ClientEvent::Disconnected => unreachable!("handled by the main loop"),
    }
}

/// Returns false when the user asked to quit.
async fn run_command(client: &Client, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let mut parts = line.splitn(3, ' ');
    let head = parts.next().unwrap_or_default();

    let result = match head {
        "/quit" => return false,
        "/list" => {
            show_transfers(client).await;
            Ok(())
        }
        "/accept" => match parse_ordinal(parts.next()) {
            Some(n) => client.accept_download(n).await.map(|path| {
                println!("* receiving into {}", path.display());
            }),
            None => {
                println!("usage: /accept <n>");
                Ok(())
            }
        },
        "/reject" => match parse_ordinal(parts.next()) {
            Some(n) => client.reject_download(n).await,
            None => {
                println!("usage: /reject <n>");
                Ok(())
            }
        },
        "/send" => match (parts.next(), parts.next()) {
            (Some(peer), Some(path)) => client.send_file(path, peer).await.map(|tid| {
                debug!("transfer {tid} announced");
            }),
            _ => {
                println!("usage: /send <peer> <path>");
                Ok(())
            }
        },
        "/msg" => match (parts.next(), parts.next()) {
            (Some(peer), Some(text)) => client.send_chat(Some(peer), text).await,
            _ => {
                println!("usage: /msg <peer> <text>");
                Ok(())
            }
        },
        "/help" => {
            println!(
                "commands: /msg <peer> <text>, /send <peer> <path>, /accept <n>, /reject <n>, /list, /quit"
            );
            Ok(())
        }
        _ if head.starts_with('/') => {
            println!("unknown command {head}; try /help");
            Ok(())
        }
        _ => client.send_chat(None, line).await,
    };

    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

async fn show_transfers(client: &Client) {
    let offers = client.pending_downloads().await;
    let progress = client.download_progress().await;
    let uploads = client.active_uploads();

    if offers.is_empty() && progress.is_empty() && uploads.is_empty() {
        println!("* no pending or active transfers");
        return;
    }
    for offer in offers {
        println!(
            "* pending #{}: {:?} ({} bytes) from {}",
            offer.ordinal, offer.file_name, offer.size, offer.sender
        );
    }
    for p in progress {
        println!(
            "* receiving {:?}: {}/{} bytes",
            p.file_name, p.bytes, p.size
        );
    }
    for (_, file_name) in uploads {
        println!("* sending {file_name:?}");
    }
}

fn parse_ordinal(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.trim().parse().ok())
}
