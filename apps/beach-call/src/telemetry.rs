fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const LOG_FILTER_ENV: &str = "BEACH_CALL_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "BEACH_CALL_TRACE_DEPS";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    ///
    /// Without a log file, events go to stderr so they never mix with the
    /// connection codes printed on stdout.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        install(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn install(config: &LogConfig) -> Result<(), InitError> {
        let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled_deps {
            eprintln!(
                "[beach-call] webrtc stack traces capped at info; set {TRACE_DEPS_ENV}=1 or {LOG_FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
            return (EnvFilter::new(filter), false);
        }
        let throttle = level == LevelFilter::TRACE && !allow_dependency_traces();
        (EnvFilter::new(default_filter_for(level, throttle)), throttle)
    }

    /// The webrtc stack is extremely chatty at trace level.
    const TRACE_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "interceptor",
        "turn",
        "stun",
        "mio",
    ];

    fn default_filter_for(level: LevelFilter, throttle_deps: bool) -> String {
        let mut filter = match level {
            LevelFilter::TRACE => "info,beach_call=trace".to_owned(),
            LevelFilter::DEBUG => "info,beach_call=debug".to_owned(),
            other => other.to_string().to_lowercase(),
        };
        if throttle_deps {
            for target in TRACE_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false)
    }

}
