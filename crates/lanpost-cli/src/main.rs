// SPDX-License-Identifier: AGPL-3.0
// Lanpost CLI - Terminal frontend
//
// The display collaborator for the session engine: prints events as they
// arrive and maps line commands onto engine calls. Reads the inbox only
// through snapshot() and filter().

use clap::Parser;
use lanpost_core::{
    MessageHistory, Message, Session, SessionEvent, SessionSettings, SettingsStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "lanpost", version, about = "LAN chat and file sharing")]
struct Args {
    /// Port to listen on (overrides the stored settings)
    #[arg(short, long)]
    port: Option<u16>,

    /// Device name shown to peers (overrides the stored settings)
    #[arg(short, long)]
    name: Option<String>,

    /// Peer address to dial on startup, e.g. 192.168.1.20:12345
    #[arg(short, long)]
    dial: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lanpost_cli=info".parse().unwrap())
                .add_directive("lanpost_core=info".parse().unwrap()),
        )
        .init();

    tracing::info!("Starting Lanpost CLI v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let mut settings = match SettingsStore::new() {
        Ok(store) => store.get(),
        Err(e) => {
            tracing::warn!("Could not load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    };
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(name) = args.name {
        settings.device_name = name;
    }

    let history = match MessageHistory::new() {
        Ok(history) => Some(history),
        Err(e) => {
            tracing::warn!("History unavailable: {}", e);
            None
        }
    };

    let session = Arc::new(Session::new(settings));
    let inbox = session.inbox();

    if let Some(history) = &history {
        for message in history.list() {
            print_message(&message);
        }
        if history.count() > 0 {
            println!("--- {} messages restored ---", history.count());
        }
    }

    match session.start_listener().await {
        Ok(addr) => println!("Listening on {}", addr),
        Err(e) => {
            eprintln!("Could not start listener: {}", e);
            std::process::exit(1);
        }
    }

    if let Some(addr) = args.dial {
        match session.connect(addr).await {
            Ok(()) => println!("Connected to {}", addr),
            Err(e) => eprintln!("Dial failed: {}", e),
        }
    }

    // Event printer
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::MessageReceived { message } => print_message(&message),
                SessionEvent::FileReceived { from, path, size } => {
                    println!("[file] {} sent {} ({} bytes)", from, path.display(), size);
                }
                SessionEvent::SendCompleted { peer, error, .. } => match error {
                    None => println!("[sent] delivered to {}", peer),
                    Some(e) => println!("[sent] to {} failed: {}", peer, e),
                },
                SessionEvent::PeerConnected { addr } => println!("[peer] {} connected", addr),
                SessionEvent::ConnectionClosed { addr, reason } => match reason {
                    Some(r) => println!("[peer] {} closed: {}", addr, r),
                    None => println!("[peer] {} closed", addr),
                },
            }
        }
    });

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ') {
            Some(("/connect", addr)) => match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    if let Err(e) = session.connect(addr).await {
                        eprintln!("Connect failed: {}", e);
                    } else {
                        println!("Connected to {}", addr);
                    }
                }
                Err(e) => eprintln!("Bad address: {}", e),
            },
            Some(("/send", text)) => {
                let peers = session.peers().await;
                if peers.is_empty() {
                    eprintln!("No peers; use /connect first");
                    continue;
                }
                let (_, results) = session.send_message(text, &peers).await;
                for (addr, result) in results {
                    if let Err(e) = result {
                        eprintln!("Send to {} failed: {}", addr, e);
                    }
                }
            }
            Some(("/sendfile", path)) => {
                let peers = session.peers().await;
                if peers.is_empty() {
                    eprintln!("No peers; use /connect first");
                    continue;
                }
                match session.send_file(&PathBuf::from(path), &peers).await {
                    Ok(results) => {
                        for (addr, result) in results {
                            if let Err(e) = result {
                                eprintln!("Send to {} failed: {}", addr, e);
                            }
                        }
                    }
                    Err(e) => eprintln!("Could not read {}: {}", path, e),
                }
            }
            Some(("/filter", query)) => {
                let hits = inbox.filter(query);
                println!("--- {} matching ---", hits.len());
                for message in hits {
                    print_message(&message);
                }
            }
            Some(("/disconnect", addr)) => match addr.parse::<SocketAddr>() {
                Ok(addr) => session.disconnect(addr).await,
                Err(e) => eprintln!("Bad address: {}", e),
            },
            None if line == "/peers" => {
                for addr in session.peers().await {
                    println!("{}", addr);
                }
            }
            None if line == "/all" => {
                for message in inbox.snapshot() {
                    print_message(&message);
                }
            }
            None if line == "/quit" => break,
            None if line == "/help" => print_help(),
            _ => eprintln!("Unknown command; /help lists commands"),
        }
    }

    if let Some(history) = &history {
        if let Err(e) = history.record(inbox.snapshot()) {
            tracing::warn!("Could not save history: {}", e);
        }
    }

    session.shutdown().await;
    println!("Bye");
}

fn print_message(message: &Message) {
    let time = message.timestamp.format("%H:%M:%S");
    match &message.file_url {
        Some(url) => println!("[{}] {}: {} <{}>", time, message.sender, message.content, url),
        None => println!("[{}] {}: {}", time, message.sender, message.content),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /connect <ip:port>     dial a peer");
    println!("  /disconnect <ip:port>  drop a peer");
    println!("  /send <text>           send to all connected peers");
    println!("  /sendfile <path>       send a file to all connected peers");
    println!("  /filter <query>        search messages (case-insensitive)");
    println!("  /all                   show every message");
    println!("  /peers                 list connected peers");
    println!("  /quit                  save history and exit");
}
