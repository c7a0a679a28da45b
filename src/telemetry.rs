use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
///
/// `RUST_LOG` overrides the default `info` filter, `LOG_FORMAT=json` switches to JSON lines.
pub async fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap();

    // Decide on layers
    let reg = Registry::default().with(env_filter);
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => reg.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => reg.with(tracing_subscriber::fmt::layer().compact()).init(),
    }
}
