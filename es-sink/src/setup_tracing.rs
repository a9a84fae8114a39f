use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_ES_SINK_DEBUG: &str = "ES_SINK_DEBUG";

/// Routes panics to `tracing`, so a panic shows up as a single error event in the JSON logs
/// instead of a multi-line message on stderr.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // only captured when RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (
        panic_info.location(),
        payload,
        backtrace.status() == BacktraceStatus::Captured,
    ) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => tracing::error!("{}\n{}", panic_info, backtrace),
    }
}

/// Installs the global subscriber. RUST_LOG overrides the default level, `ES_SINK_DEBUG=true`
/// switches to debug level and human readable output.
pub fn register() {
    let debug_mode = std::env::var(ENV_ES_SINK_DEBUG).is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_log_level = if debug_mode {
        // hyper and h2 are too noisy at debug
        "debug,hyper_util=info,h2=info"
    } else {
        "info"
    };

    let directives =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| default_log_level.to_string());
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .parse_lossy(directives);

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
