use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by the transfer core for bucket and chunk bookkeeping.
pub const TRANSFER_TARGET: &str = "nxsync.transfer";

static TRANSFER_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

/// Rolling file log for the transfer target, read from `NXSYNC_TRANSFER_LOG_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLogSettings {
    pub dir: PathBuf,
    pub prefix: String,
    pub rotation: Rotation,
    pub level: tracing::Level,
}

impl TransferLogSettings {
    /// `None` unless `NXSYNC_TRANSFER_LOG_ROLL=1`.
    pub fn from_env() -> Option<Self> {
        if std::env::var("NXSYNC_TRANSFER_LOG_ROLL").ok().as_deref() != Some("1") {
            return None;
        }
        let dir = std::env::var("NXSYNC_TRANSFER_LOG_DIR")
            .ok()
            .or_else(|| std::env::var("NXSYNC_LOGS_DIR").ok())
            .unwrap_or_else(|| "logs".to_string());
        let prefix =
            std::env::var("NXSYNC_TRANSFER_LOG_PREFIX").unwrap_or_else(|_| "transfer".into());
        let rotation = std::env::var("NXSYNC_TRANSFER_LOG_ROTATION")
            .map(|r| Rotation::parse(&r))
            .unwrap_or(Rotation::Daily);
        let level = match std::env::var("NXSYNC_TRANSFER_LOG_LEVEL")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            _ => tracing::Level::INFO,
        };
        Some(Self {
            dir: PathBuf::from(dir),
            prefix,
            rotation,
            level,
        })
    }
}

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter, TransferLogSettings::from_env());
}

fn install_console(filter: EnvFilter, transfer_log: Option<TransferLogSettings>) {
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if let Some(settings) = transfer_log {
        if std::fs::create_dir_all(&settings.dir).is_err() {
            tracing::warn!(directory = %settings.dir.display(), "failed to create transfer log directory");
        }
        let writer = match settings.rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&settings.dir, &settings.prefix),
            Rotation::Minutely => {
                tracing_appender::rolling::minutely(&settings.dir, &settings.prefix)
            }
            Rotation::Daily => tracing_appender::rolling::daily(&settings.dir, &settings.prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = TRANSFER_GUARD.set(guard);
        let targets = Targets::new().with_target(TRANSFER_TARGET, settings.level);
        let transfer_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let subscriber = registry.with(transfer_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = registry.try_init();
    }
}
