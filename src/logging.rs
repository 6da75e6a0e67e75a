use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the console subscriber for the binary.
///
/// `RUST_LOG` wins over the default directive; `verbose` lowers the default
/// to debug.
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "ans_despesas=debug"
    } else {
        "ans_despesas=info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    // A second init (tests, embedding) is not an error
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}
