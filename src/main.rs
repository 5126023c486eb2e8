#![deny(dead_code)]
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use parley::{
    CheckpointStore, CoreConfig, CryptoService, FileKeyStore, Message, MessageType, MessagingSession,
    PermissionRecord, PermissionStore, SessionEvent, TransferEvent, TransferManager, TransferOffer,
};

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: messaging, presence and encrypted peer-to-peer file transfer.",
    long_about = "parley talks to a WebSocket messaging backend and moves files directly between peers.\n\n\
    Configuration is read from the user config directory (config.json) and PARLEY_* environment variables.\n\
    Use -h or --help on any subcommand to see its options."
)]
struct Args {
    /// Configuration file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the log here instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Override the messaging endpoint (ws:// or wss://)
    #[arg(long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the identity key pair and print the public key
    Keygen {
        /// Replace an existing key pair
        #[arg(long)]
        force: bool,
    },
    /// Encrypt a file for the holder of a public key
    EncryptFile {
        input: PathBuf,
        output: PathBuf,
        /// PEM file with the recipient's public key
        #[arg(long)]
        recipient: PathBuf,
    },
    /// Decrypt a file encrypted for our key
    DecryptFile { input: PathBuf, output: PathBuf },
    /// Interactive line-based chat
    Chat {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
    },
    /// Offer a file to a peer and stream it to their listener
    SendFile {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
        /// Receiving user id
        #[arg(long)]
        to: String,
        /// The receiver's transfer listener, host:port
        #[arg(long)]
        peer_addr: String,
        /// Encrypt chunks for this PEM public key
        #[arg(long)]
        recipient_key: Option<PathBuf>,
        file: PathBuf,
    },
    /// Accept offered files into a directory
    Receive {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        save_dir: PathBuf,
    },
}

/// Services shared by the networked subcommands
struct Core {
    session: Arc<MessagingSession>,
    transfers: Arc<TransferManager>,
}

fn crypto_service(config: &CoreConfig) -> Result<Arc<CryptoService>> {
    let store = FileKeyStore::new(config.key_path());
    let crypto = CryptoService::with_key_store(Box::new(store))?;
    crypto.ensure_key_pair()?;
    Ok(Arc::new(crypto))
}

async fn connect(config: &CoreConfig, user: &str, token: &str) -> Result<Core> {
    let crypto = crypto_service(config)?;
    let db = config.database_path();
    let checkpoints = Arc::new(CheckpointStore::open(&db)?);
    let permissions = Arc::new(PermissionStore::open(&db)?);
    let transfers = Arc::new(TransferManager::new(
        user,
        crypto.clone(),
        checkpoints,
        permissions,
        config.transfer_config(),
    ));

    let session = Arc::new(MessagingSession::with_subscriber_buffer(
        crypto,
        transfers.clone(),
        config.subscriber_buffer,
    ));
    session.initialize(&config.endpoint)?;
    session
        .connect(user, token)
        .await
        .with_context(|| format!("could not connect to {}", config.endpoint))?;
    println!("Connected to {} as {}", config.endpoint, user);

    Ok(Core { session, transfers })
}

fn print_event(session: &MessagingSession, event: &SessionEvent) {
    match event {
        SessionEvent::MessageReceived(message) => match message.kind() {
            MessageType::Encrypted => match session.decrypt_message(message) {
                Ok(text) => println!("[{}] (encrypted) {}", message.sender_id(), text),
                Err(e) => println!("[{}] undecryptable message: {}", message.sender_id(), e),
            },
            MessageType::FileTransfer => println!("[{}] offered a file: {}", message.sender_id(), message.content()),
            _ => println!("[{}] {}", message.sender_id(), message.content()),
        },
        SessionEvent::StatusChanged(status) => println!(
            "* {} is {}{}",
            status.user_id,
            if status.is_online { "online" } else { "offline" },
            if status.status_message.is_empty() { String::new() } else { format!(" ({})", status.status_message) }
        ),
        SessionEvent::FriendRequest(request) => println!(
            "* friend request {} from {}: {} (/accept {} or /reject {})",
            request.request_id, request.sender_id, request.message, request.request_id, request.request_id
        ),
        SessionEvent::FriendRequestAnswered(request) => {
            println!("* {} answered your friend request: {:?}", request.receiver_id, request.status)
        }
        SessionEvent::ConnectionChanged(status) => println!("* connection {:?}", status),
        SessionEvent::Malformed { reason } => warn!("Malformed envelope: {}", reason),
    }
}

async fn handle_chat_line(session: &MessagingSession, line: &str) -> Result<bool> {
    let mut words = line.splitn(2, ' ');
    let head = words.next().unwrap_or_default();
    let rest = words.next().unwrap_or_default().trim();

    match head {
        "/quit" => return Ok(false),
        "/friend" => {
            let (user, note) = rest.split_once(' ').unwrap_or((rest, ""));
            let id = session.add_friend(user, note).await?;
            println!("* friend request {} sent to {}", id, user);
        }
        "/accept" => session.accept_friend_request(rest).await?,
        "/reject" => session.reject_friend_request(rest).await?,
        "/friends" => println!("* friends: {}", session.friends().join(", ")),
        "/online" => println!("* online: {}", session.get_online_users().join(", ")),
        "/status" => session.update_status(true, rest)?,
        "/key" => println!("{}", session.crypto().get_public_key()?),
        _ if head.starts_with('@') => {
            session.send_message(Message::text(&head[1..], rest)).await?;
        }
        _ => println!("* commands: @user text, /friend user [note], /accept id, /reject id, /friends, /online, /status text, /key, /quit"),
    }
    Ok(true)
}

async fn run_chat(config: &CoreConfig, user: &str, token: &str) -> Result<()> {
    let core = connect(config, user, token).await?;
    let mut events = core.session.subscribe();

    let printer_session = core.session.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&printer_session, &event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_chat_line(&core.session, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {}", e),
        }
    }

    core.session.disconnect().await?;
    printer.abort();
    Ok(())
}

async fn run_send_file(
    config: &CoreConfig,
    user: &str,
    token: &str,
    to: &str,
    peer_addr: &str,
    recipient_key: Option<&Path>,
    file: &Path,
) -> Result<()> {
    let core = connect(config, user, token).await?;
    let mut events = core.transfers.subscribe();

    // Offering a file from the command line grants the receiver read access
    core.transfers.set_permissions(file, to, &PermissionRecord::read_only())?;
    let transfer_id = core.session.initiate_file_transfer(to, file).await?;
    if let Some(path) = recipient_key {
        let pem = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        core.transfers.set_peer_public_key(&transfer_id, &pem).await?;
    }
    core.transfers
        .set_progress_callback(&transfer_id, |done, total| {
            info!("sent {}/{} bytes", done, total);
        })
        .await?;
    core.transfers.initiate_p2p_transfer(&transfer_id, peer_addr).await?;
    println!("Transfer {} started", transfer_id);

    let outcome = loop {
        match events.recv().await {
            Some(TransferEvent::Completed { transfer_id: id }) if id == transfer_id => break Ok(()),
            Some(TransferEvent::Cancelled { transfer_id: id }) if id == transfer_id => {
                break Err(anyhow!("transfer cancelled"))
            }
            Some(TransferEvent::Failed { transfer_id: id, error }) if id == transfer_id => {
                break Err(anyhow!("transfer failed: {}", error))
            }
            Some(_) => {}
            None => break Err(anyhow!("transfer events ended unexpectedly")),
        }
    };

    core.transfers.cleanup_transfer(&transfer_id).await?;
    core.session.disconnect().await?;
    outcome?;
    println!("Transfer {} complete", transfer_id);
    Ok(())
}

async fn accept_offer(core: &Core, message: &Message, save_dir: &Path) -> Result<()> {
    let offer = TransferOffer::from_message(message)?;
    let name = Path::new(&offer.file_name)
        .file_name()
        .ok_or_else(|| anyhow!("offer {} has no usable file name", offer.transfer_id))?;
    let target = save_dir.join(name);
    core.transfers.accept_transfer(&offer, &target).await?;
    println!(
        "Accepting {} ({} bytes) from {} into {}",
        offer.file_name,
        offer.total_size,
        offer.sender_id,
        target.display()
    );
    Ok(())
}

async fn run_receive(config: &CoreConfig, user: &str, token: &str, save_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(save_dir)?;
    let core = connect(config, user, token).await?;
    let addr = core.transfers.listen(&config.listen_addr).await?;
    println!("Listening for transfers on {} (Ctrl-C to stop)", addr);

    let mut session_events = core.session.subscribe();
    let mut transfer_events = core.transfers.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = session_events.recv() => match event {
                Some(SessionEvent::MessageReceived(message)) if message.kind() == MessageType::FileTransfer => {
                    if let Err(e) = accept_offer(&core, &message, save_dir).await {
                        error!("Could not accept offer {}: {}", message.id(), e);
                    }
                }
                Some(event) => print_event(&core.session, &event),
                None => break,
            },
            event = transfer_events.recv() => match event {
                Some(TransferEvent::Completed { transfer_id }) => println!("Transfer {} complete", transfer_id),
                Some(TransferEvent::Failed { transfer_id, error }) => println!("Transfer {} failed: {}", transfer_id, error),
                Some(TransferEvent::Cancelled { transfer_id }) => println!("Transfer {} cancelled", transfer_id),
                Some(_) => {}
                None => break,
            },
        }
    }

    core.transfers.cleanup_all_transfers().await?;
    core.session.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.log_file.as_deref(), args.log_level)?;

    let mut config = CoreConfig::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    info!("Data directory: {}", config.data_dir.display());

    match args.command {
        Command::Keygen { force } => {
            let crypto = CryptoService::with_key_store(Box::new(FileKeyStore::new(config.key_path())))?;
            if crypto.has_key_pair() && !force {
                bail!("a key pair already exists at {} (use --force to replace it)", config.key_path().display());
            }
            crypto.generate_key_pair()?;
            println!("{}", crypto.get_public_key()?);
            println!("Fingerprint: {}", crypto.fingerprint()?);
        }
        Command::EncryptFile { input, output, recipient } => {
            let pem = std::fs::read_to_string(&recipient).with_context(|| format!("reading {}", recipient.display()))?;
            let crypto = CryptoService::new();
            let bytes = crypto.encrypt_file(&input, &output, &pem)?;
            println!("Encrypted {} bytes into {}", bytes, output.display());
        }
        Command::DecryptFile { input, output } => {
            let crypto = crypto_service(&config)?;
            let bytes = crypto.decrypt_file(&input, &output)?;
            println!("Decrypted {} bytes into {}", bytes, output.display());
        }
        Command::Chat { user, token } => run_chat(&config, &user, &token).await?,
        Command::SendFile { user, token, to, peer_addr, recipient_key, file } => {
            run_send_file(&config, &user, &token, &to, &peer_addr, recipient_key.as_deref(), &file).await?
        }
        Command::Receive { user, token, save_dir } => run_receive(&config, &user, &token, &save_dir).await?,
    }

    Ok(())
}
