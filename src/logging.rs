use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Set to `json` for one JSON object per event.
pub const LOG_FORMAT_ENV: &str = "FUNCTIONS_E2E_LOG_FORMAT";

/// `RUST_LOG` filtering, `info` when unset. Output goes to stderr so
/// `list` stays pipeable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();
}
