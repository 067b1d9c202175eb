use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use call_handshake::HandshakeConfig;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-call",
    about = "📞  Start a peer-to-peer call by trading connection codes by hand",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub media: MediaArgs,

    #[arg(
        long = "copy",
        global = true,
        help = "Copy the generated connection code to the system clipboard"
    )]
    pub copy: bool,

    #[arg(
        long = "connect-timeout-secs",
        global = true,
        env = "BEACH_CALL_CONNECT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        help = "How long to wait for the peer to connect after codes are exchanged"
    )]
    pub connect_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "BEACH_CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "BEACH_CALL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// Overrides for [`HandshakeConfig`]; anything left unset keeps the value
/// read from the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    #[arg(
        long = "gather-timeout-ms",
        global = true,
        value_name = "MS",
        help = "Stop waiting for ICE candidates after this many milliseconds [default: 2000]"
    )]
    pub gather_timeout_ms: Option<u64>,

    #[arg(
        long = "ice-server",
        global = true,
        value_name = "URL",
        help = "STUN/TURN server URL; repeat to use several"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "no-stun",
        global = true,
        help = "Use no ICE servers at all; only host candidates are offered"
    )]
    pub no_stun: bool,
}

impl NetworkArgs {
    pub fn apply(&self, mut config: HandshakeConfig) -> HandshakeConfig {
        if let Some(ms) = self.gather_timeout_ms.filter(|ms| *ms > 0) {
            config = config.with_gather_timeout(Duration::from_millis(ms));
        }
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(self.ice_servers.clone());
        }
        if self.no_stun {
            config.ice_servers.clear();
        }
        config
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct MediaArgs {
    #[arg(
        long = "no-media",
        global = true,
        help = "Skip camera and microphone; the call is receive-only"
    )]
    pub no_media: bool,

    #[arg(long = "muted", global = true, help = "Start with the microphone muted")]
    pub muted: bool,

    #[arg(long = "camera-off", global = true, help = "Start with the camera turned off")]
    pub camera_off: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an invite code, then apply the answer your peer sends back
    Offer(OfferArgs),
    /// Answer an invite code from your peer
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct OfferArgs {
    #[arg(
        long = "answer-file",
        value_name = "PATH",
        help = "Read the answer code from a file instead of stdin"
    )]
    pub answer_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct JoinArgs {
    #[arg(
        long = "offer-file",
        value_name = "PATH",
        conflicts_with = "offer",
        help = "Read the invite code from a file"
    )]
    pub offer_file: Option<PathBuf>,

    /// Invite code; prompts on stdin when omitted
    #[arg(value_name = "CODE")]
    pub offer: Option<String>,
}
