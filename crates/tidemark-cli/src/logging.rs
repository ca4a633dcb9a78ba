use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for the CLI.
///
/// `RUST_LOG` takes precedence when set. Otherwise the requested level
/// applies to the tidemark crates only, with everything else held at
/// `warn` so dependency chatter stays out of command output.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn default_directives(log_level: &str) -> String {
    format!(
        "warn,tidemark_engine={log_level},tidemark_state={log_level},tidemark={log_level}"
    )
}
