use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber. `RUST_LOG` controls the
/// filter; `CASEMILL_LOG_FORMAT=json` switches to line-delimited JSON.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CASEMILL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
