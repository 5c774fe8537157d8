use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_file_destination() -> String {
    "/data".to_string()
}
fn default_progress_interval_secs() -> u64 {
    1
}
fn default_progress_update_percent() -> u64 {
    10
}

#[derive(Debug, Clone)]
pub struct Config {
    /// API listener port.
    pub port: u16,
    /// API listener bind address.
    pub host: String,
    /// Directory downloads are written into.
    pub file_destination: String,
    pub irc_server: Option<String>,
    pub irc_nick: Option<String>,
    pub irc_channel: Option<String>,
    /// Progress tick period in seconds.
    pub progress_interval_secs: u64,
    /// Log-throttle granularity: a progress line is written when the percent
    /// lands on a multiple of this value.
    pub progress_update_percent: u64,
    /// Optional append log sink in addition to stderr.
    pub log_file: Option<String>,
    pub debug: bool,
    /// When set, progress is logged as full lines instead of a
    /// carriage-return-rewritten TTY line.
    pub disable_progress_ansi: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", default_port()),
            host: env_string("HOST").unwrap_or_else(default_host),
            file_destination: env_string("FILE_DESTINATION")
                .unwrap_or_else(default_file_destination),
            irc_server: env_string("IRC_SERVER"),
            irc_nick: env_string("IRC_NICK"),
            irc_channel: env_string("IRC_CHANNEL"),
            progress_interval_secs: env_parse(
                "PROGRESS_INTERVAL",
                default_progress_interval_secs(),
            )
            .max(1),
            progress_update_percent: env_parse(
                "PROGRESS_UPDATE_PERCENT",
                default_progress_update_percent(),
            )
            .clamp(1, 100),
            log_file: env_string("LOG_FILE"),
            debug: env_bool("DEBUG", false),
            disable_progress_ansi: env_bool("DISABLE_PROGRESS_ANSI", true),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Install the global tracing subscriber.
///
/// Priority order for the filter:
/// 1) RUST_LOG (standard in Rust ecosystem)
/// 2) DEBUG=true (maps to `debug`)
/// 3) default (info)
///
/// When `LOG_FILE` is set, log lines are mirrored into that file through a
/// non-blocking appender; the returned guard must stay alive for the whole
/// process or buffered lines are lost. A sink that cannot be opened degrades
/// to stderr-only.
pub fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| if config.debug { "debug" } else { "info" }.to_string());
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &config.log_file {
        match open_log_sink(Path::new(path)) {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr).compact())
                    .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                    .init();
                return Some(guard);
            }
            Err(error) => {
                eprintln!("could not open log file '{path}': {error}; logging to stderr only");
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
    None
}

fn open_log_sink(path: &Path) -> std::io::Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("log file path has no file name"))?;
    std::fs::create_dir_all(&dir)?;
    Ok(tracing_appender::rolling::never(dir, file.to_os_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var manipulation is process-global; tests serialize on this.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), std::env::var(k).ok()))
            .collect();
        for (k, v) in vars {
            match v {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
        f();
        for (k, v) in saved {
            match v {
                Some(v) => unsafe { std::env::set_var(&k, v) },
                None => unsafe { std::env::remove_var(&k) },
            }
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        with_env(
            &[
                ("PORT", None),
                ("HOST", None),
                ("FILE_DESTINATION", None),
                ("IRC_SERVER", None),
                ("PROGRESS_INTERVAL", None),
                ("PROGRESS_UPDATE_PERCENT", None),
                ("DISABLE_PROGRESS_ANSI", None),
                ("DEBUG", None),
            ],
            || {
                let cfg = Config::from_env();
                assert_eq!(cfg.port, 8080);
                assert_eq!(cfg.host, "0.0.0.0");
                assert_eq!(cfg.file_destination, "/data");
                assert!(cfg.irc_server.is_none());
                assert_eq!(cfg.progress_interval_secs, 1);
                assert_eq!(cfg.progress_update_percent, 10);
                assert!(!cfg.debug);
                assert!(cfg.disable_progress_ansi);
            },
        );
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        with_env(
            &[
                ("PORT", Some("not-a-port")),
                ("PROGRESS_INTERVAL", Some("0")),
                ("PROGRESS_UPDATE_PERCENT", Some("250")),
            ],
            || {
                let cfg = Config::from_env();
                assert_eq!(cfg.port, 8080);
                // a zero interval would spin the timer
                assert_eq!(cfg.progress_interval_secs, 1);
                assert_eq!(cfg.progress_update_percent, 100);
            },
        );
    }

    #[test]
    fn debug_flag_accepts_common_spellings() {
        for value in ["1", "true", "TRUE", "yes", "on"] {
            with_env(&[("DEBUG", Some(value))], || {
                assert!(Config::from_env().debug, "value {value:?} should enable");
            });
        }
        with_env(&[("DEBUG", Some("definitely"))], || {
            assert!(!Config::from_env().debug);
        });
    }
}
