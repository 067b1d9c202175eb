use std::sync::Arc;
use std::time::Duration;

use call_handshake::{
    ConnectionState, Handshake, HandshakeConfig, HandshakeOrchestrator, PeerSession, Status,
};
use call_webrtc::WebRtcEngineFactory;
use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Command, JoinArgs, MediaArgs, OfferArgs};
use crate::clipboard::SystemClipboard;
use crate::error::CliError;
use crate::media::SyntheticMedia;
use crate::prompt::{BlobPrompt, read_blob_file};

const ANSWER_PROMPT: &str = "Paste the answer code from your peer, then press Enter:";
const INVITE_PROMPT: &str = "Paste the invite code from your peer, then press Enter:";

pub async fn run(cli: Cli) -> Result<(), CliError> {
    if cli.connect_timeout_secs == 0 {
        return Err(CliError::InvalidArgument(
            "--connect-timeout-secs must be greater than zero".into(),
        ));
    }
    let config = cli.network.apply(HandshakeConfig::from_env());
    debug!(
        target: "beach_call::app",
        gather_timeout_ms = config.gather_timeout.as_millis() as u64,
        ice_servers = config.ice_servers.len(),
        "handshake configured"
    );

    let engines = Arc::new(WebRtcEngineFactory::new(&config));
    let mut orchestrator =
        HandshakeOrchestrator::new(engines, config).with_clipboard(Arc::new(SystemClipboard));
    if !cli.media.no_media {
        orchestrator = orchestrator.with_media_source(Arc::new(SyntheticMedia));
    }

    let reporter = spawn_status_reporter(orchestrator.subscribe_status());
    prepare_media(&orchestrator, &cli.media).await;

    let options = CallOptions {
        copy: cli.copy,
        connect_timeout: cli.connect_timeout(),
    };
    let result = match cli.command {
        Command::Offer(args) => run_offer(&orchestrator, args, &options).await,
        Command::Join(args) => run_join(&orchestrator, args, &options).await,
    };

    // Dropping the orchestrator closes the status channel so the reporter
    // can print the last message and exit.
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_millis(200), reporter).await;
    result
}

struct CallOptions {
    copy: bool,
    connect_timeout: Duration,
}

async fn prepare_media(orchestrator: &HandshakeOrchestrator, args: &MediaArgs) {
    if args.no_media {
        return;
    }
    match orchestrator.prepare_media().await {
        Ok(Some(_)) => {
            if args.muted {
                orchestrator.toggle_mic();
            }
            if args.camera_off {
                orchestrator.toggle_video();
            }
        }
        Ok(None) => {}
        Err(err) => warn!(target: "beach_call::app", error = %err, "continuing receive-only"),
    }
}

async fn run_offer(
    orchestrator: &HandshakeOrchestrator,
    args: OfferArgs,
    options: &CallOptions,
) -> Result<(), CliError> {
    let handshake = orchestrator.initiate().await?;
    present_blob(orchestrator, "Invite code", &handshake.blob, options.copy);

    let mut prompt = BlobPrompt::stdin();
    loop {
        let answer = match &args.answer_file {
            Some(path) => read_blob_file(path).await?,
            None => prompt.next_blob(ANSWER_PROMPT).await?,
        };
        match orchestrator.complete(&handshake.session, &answer).await {
            Ok(()) => break,
            // A bad paste leaves the session waiting, so ask again.
            Err(err) if err.is_bad_input() && args.answer_file.is_none() => {
                eprintln!("⚠️  {err}; try again");
            }
            Err(err) => {
                orchestrator.hang_up(&handshake.session).await;
                return Err(err.into());
            }
        }
    }

    hold_call(orchestrator, &handshake.session, options.connect_timeout).await
}

async fn run_join(
    orchestrator: &HandshakeOrchestrator,
    args: JoinArgs,
    options: &CallOptions,
) -> Result<(), CliError> {
    let handshake = match (args.offer, args.offer_file) {
        (Some(code), _) => orchestrator.join(&code).await?,
        (None, Some(path)) => orchestrator.join(&read_blob_file(&path).await?).await?,
        (None, None) => join_from_prompt(orchestrator, &mut BlobPrompt::stdin()).await?,
    };
    present_blob(orchestrator, "Answer code", &handshake.blob, options.copy);

    hold_call(orchestrator, &handshake.session, options.connect_timeout).await
}

/// Each failed join closes its session, so a bad paste is simply retried
/// with a fresh one.
async fn join_from_prompt<R: AsyncBufRead + Unpin>(
    orchestrator: &HandshakeOrchestrator,
    prompt: &mut BlobPrompt<R>,
) -> Result<Handshake, CliError> {
    loop {
        let offer = prompt.next_blob(INVITE_PROMPT).await?;
        match orchestrator.join(&offer).await {
            Ok(handshake) => return Ok(handshake),
            Err(err) if err.is_bad_input() => eprintln!("⚠️  {err}; try again"),
            Err(err) => return Err(err.into()),
        }
    }
}

/// The code goes alone on stdout so it can be piped; everything else is
/// written to stderr.
fn present_blob(orchestrator: &HandshakeOrchestrator, label: &str, blob: &str, copy: bool) {
    eprintln!("{label} (send this to your peer):");
    println!("{blob}");
    if copy && orchestrator.copy_blob(blob).is_err() {
        eprintln!("⚠️  clipboard unavailable; copy the code above by hand");
    }
}

async fn hold_call(
    orchestrator: &HandshakeOrchestrator,
    session: &PeerSession,
    connect_timeout: Duration,
) -> Result<(), CliError> {
    eprintln!("Waiting for the peer to connect...");
    let outcome = tokio::select! {
        outcome = orchestrator.wait_for_outcome(session, connect_timeout) => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(target: "beach_call::app", session_id = %session.id(), "cancelled before connecting");
            orchestrator.hang_up(session).await;
            return Ok(());
        }
    };

    match outcome {
        Some(ConnectionState::Connected) => {}
        Some(ConnectionState::Failed) => {
            orchestrator.hang_up(session).await;
            return Err(CliError::ConnectionFailed);
        }
        Some(_) => return Ok(()),
        None => {
            orchestrator.hang_up(session).await;
            return Err(CliError::ConnectTimeout(connect_timeout));
        }
    }

    eprintln!("📞 Connected. Press Ctrl-C to hang up.");
    let mut states = session.subscribe_state();
    let ended = async {
        states
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state)
            .ok()
    };

    let failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(target: "beach_call::app", session_id = %session.id(), "hang-up requested");
            false
        }
        state = ended => state == Some(ConnectionState::Failed),
    };

    orchestrator.hang_up(session).await;
    if failed {
        return Err(CliError::ConnectionFailed);
    }
    Ok(())
}

fn spawn_status_reporter(mut status: watch::Receiver<Status>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = String::new();
        loop {
            let current = status.borrow_and_update().clone();
            if current.message != last {
                if current.is_error() {
                    eprintln!("❌ {}", current.message);
                } else {
                    eprintln!("• {}", current.message);
                }
                last = current.message;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    })
}
