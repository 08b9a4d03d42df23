use tracing_subscriber::EnvFilter;

/// Route everything through `RUST_LOG`, defaulting to info for our own
/// crates and warn for the noisy HTTP stack.
pub(crate) fn setup(verbose: bool) {
    let default_filter = if verbose {
        "debug,hyper=warn,reqwest=warn,sqlx=warn"
    } else {
        "info,hyper=warn,reqwest=warn,sqlx=warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
