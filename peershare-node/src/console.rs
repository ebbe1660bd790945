//! Line-oriented console on stdin: share, list, fetch and remove files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use peershare_core::{FileEvent, FileSharing};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::transport::{self, TcpOverlay};

const HELP: &str = "\
commands:
  share <path> [mime]                    share a local file
  shared                                 list files we share
  available                              list files other peers announced
  fetch <peer-id> <file-id> [out-path]   download a file
  remove <file-id>                       stop sharing a file
  connect <host:port>                    dial a peer
  peers                                  list connected peers
  id                                     print our peer id
  help                                   this text
  quit                                   exit";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Share { path: PathBuf, mime: Option<String> },
    Shared,
    Available,
    Fetch {
        peer_id: String,
        file_id: String,
        out: Option<PathBuf>,
    },
    Remove { file_id: String },
    Connect { addr: String },
    Peers,
    Id,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();
        let cmd = match (verb, args.as_slice()) {
            ("share", [path]) => Command::Share {
                path: PathBuf::from(path),
                mime: None,
            },
            ("share", [path, mime]) => Command::Share {
                path: PathBuf::from(path),
                mime: Some(mime.to_string()),
            },
            ("shared", []) => Command::Shared,
            ("available", []) => Command::Available,
            ("fetch", [peer, file]) => Command::Fetch {
                peer_id: peer.to_string(),
                file_id: file.to_string(),
                out: None,
            },
            ("fetch", [peer, file, out]) => Command::Fetch {
                peer_id: peer.to_string(),
                file_id: file.to_string(),
                out: Some(PathBuf::from(out)),
            },
            ("remove", [id]) => Command::Remove {
                file_id: id.to_string(),
            },
            ("connect", [addr]) => Command::Connect {
                addr: addr.to_string(),
            },
            ("peers", []) => Command::Peers,
            ("id", []) => Command::Id,
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            (
                "share" | "shared" | "available" | "fetch" | "remove" | "connect" | "peers" | "id"
                | "help" | "?" | "quit" | "exit",
                _,
            ) => return Err(format!("wrong arguments for '{}' (try 'help')", verb)),
            _ => return Err(format!("unknown command '{}' (try 'help')", verb)),
        };
        Ok(Some(cmd))
    }
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run_console(
    fs: Arc<FileSharing>,
    overlay: Arc<TcpOverlay>,
    download_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);
    while let Some(line) = lines.next_line().await? {
        let cmd = match Command::parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };
        if cmd == Command::Quit {
            break;
        }
        if let Err(e) = execute(cmd, &fs, &overlay, &download_dir).await {
            println!("error: {:#}", e);
        }
    }
    Ok(())
}

async fn execute(
    cmd: Command,
    fs: &FileSharing,
    overlay: &Arc<TcpOverlay>,
    download_dir: &Path,
) -> anyhow::Result<()> {
    match cmd {
        Command::Share { path, mime } => {
            let payload = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mime = mime.unwrap_or_else(|| guess_mime(&path).to_string());
            let size = payload.len() as u64;
            let id = fs.share_file(payload, &name, &mime, size).await?;
            println!("shared {} as {}", name, id);
        }
        Command::Shared => {
            let files = fs.get_shared_files();
            if files.is_empty() {
                println!("(nothing shared)");
            }
            for f in files {
                println!("{}  {:>10}  {}  {}", f.id, f.size_bytes, f.mime_type, f.name);
            }
        }
        Command::Available => {
            let records = fs.get_available_files();
            if records.is_empty() {
                println!("(no announced files)");
            }
            for r in records {
                println!(
                    "{}  {}  {:>10}  {}",
                    r.peer_id, r.file_id, r.file_size_bytes, r.file_name
                );
            }
        }
        Command::Fetch {
            peer_id,
            file_id,
            out,
        } => {
            let file = fs.request_file(&peer_id, &file_id).await?;
            let dest = match out {
                Some(p) => p,
                None => {
                    tokio::fs::create_dir_all(download_dir)
                        .await
                        .with_context(|| format!("creating {}", download_dir.display()))?;
                    download_dir.join(safe_file_name(&file.name, &file.id))
                }
            };
            tokio::fs::write(&dest, &file.payload)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            println!("saved {} ({} bytes) to {}", file.name, file.size_bytes, dest.display());
        }
        Command::Remove { file_id } => {
            if fs.remove_shared_file(&file_id) {
                println!("removed {}", file_id);
            } else {
                println!("no shared file {}", file_id);
            }
        }
        Command::Connect { addr } => {
            let peer = transport::dial(overlay, &addr).await?;
            println!("connected to {}", peer);
        }
        Command::Peers => {
            let peers = overlay.connected_peers();
            if peers.is_empty() {
                println!("(no peers)");
            }
            for (id, addr) in peers {
                println!("{}  {}", id, addr);
            }
        }
        Command::Id => println!("{}", fs.local_peer_id()),
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

/// Print file events as they arrive.
pub async fn print_events(mut rx: mpsc::UnboundedReceiver<FileEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            FileEvent::FileAnnounced(r) => println!(
                "* {} announced {} ({} bytes) as {}",
                r.peer_id, r.file_name, r.file_size_bytes, r.file_id
            ),
            FileEvent::FileReceived {
                peer_id,
                name,
                size_bytes,
                ..
            } => println!("* received {} ({} bytes) from {}", name, size_bytes, peer_id),
            FileEvent::RecordsDropped {
                peer_id: Some(peer),
                count,
            } => println!("* forgot {} files from {}", count, peer),
            FileEvent::RecordsDropped {
                peer_id: None,
                count,
            } => println!("* {} announced files expired", count),
            FileEvent::FileShared { .. } | FileEvent::FileRemoved { .. } => {}
        }
    }
}

/// Last path component of a remote-supplied name, falling back to the file id.
fn safe_file_name(name: &str, file_id: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| file_id.to_string())
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
