use clap::{Parser, Subcommand};
use log::{error, info, warn};
use peercall::{CallClient, CallConfig, CallError, CallStatus, CallType, MemoryStore, SignalingStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer calls over a shared signaling store", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two clients in one process place and answer a call
    Demo {
        /// JSON CallConfig file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Place a video call instead of a voice call
        #[arg(long)]
        video: bool,

        /// The callee declines instead of answering
        #[arg(long)]
        reject: bool,

        /// No STUN/TURN servers; host candidates only
        #[arg(long)]
        offline: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        hold: u64,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    peercall::logger::init(&args.log);

    let result = match args.command {
        Command::Demo {
            config,
            video,
            reject,
            offline,
            hold,
        } => demo(config, video, reject, offline, Duration::from_secs(hold)).await,
    };

    if let Err(e) = result {
        error!("demo failed: {}", e);
        std::process::exit(1);
    }
}

async fn demo(
    config: Option<PathBuf>,
    video: bool,
    reject: bool,
    offline: bool,
    hold: Duration,
) -> Result<(), CallError> {
    let mut config = match config {
        Some(path) => CallConfig::load(path)?,
        None => CallConfig::default(),
    };
    if offline {
        config.ice_servers.clear();
    }

    let store = MemoryStore::new();
    let shared: Arc<dyn SignalingStore> = Arc::new(store.clone());
    shared
        .write(&config.paths().user("alice"), json!({"name": "Alice"}))
        .await?;
    shared
        .write(&config.paths().user("bob"), json!({"name": "Bob"}))
        .await?;

    let alice = CallClient::with_defaults("alice", shared.clone(), &config).await?;
    let bob = CallClient::with_defaults("bob", shared, &config).await?;

    let call_type = if video { CallType::Video } else { CallType::Voice };
    let session_id = alice.start_call("bob", call_type).await?;
    info!("alice is calling bob ({:?}, session {})", call_type, session_id);

    let mut invitations = bob.invitations();
    let invitation = timeout(Duration::from_secs(10), invitations.wait_for(Option::is_some))
        .await
        .map_err(|_| CallError::NoInvitation)?
        .map_err(|_| CallError::NoInvitation)?
        .clone();
    if let Some(invitation) = invitation {
        info!("bob sees a call from {}", invitation.caller_name);
    }

    if reject {
        bob.reject_call().await?;
        wait_for_status(&alice, |s| s.is_terminal(), Duration::from_secs(10)).await;
    } else {
        bob.accept_call().await?;
        let connected = wait_for_status(
            &alice,
            |s| s == CallStatus::Connected || s.is_terminal(),
            Duration::from_secs(30),
        )
        .await;
        if connected == CallStatus::Connected {
            info!("connected, holding for {:?}", hold);
            sleep(hold).await;
        } else {
            warn!("call did not connect ({})", connected);
        }
        alice.end_call().await?;
        wait_for_status(&bob, |s| s.is_terminal(), Duration::from_secs(10)).await;
    }

    info!(
        "alice: {}, bob: {}, record present: {}",
        alice.snapshot().status,
        bob.snapshot().status,
        store.get(&config.paths().session(&session_id)).is_some()
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn wait_for_status(
    client: &CallClient,
    done: impl Fn(CallStatus) -> bool,
    limit: Duration,
) -> CallStatus {
    let mut view = client.view();
    let _ = timeout(limit, view.wait_for(|v| done(v.status))).await;
    let status = view.borrow().status;
    info!("{}: {}", client.user_id(), status);
    status
}
