//! Bootstrap: CLI flags, logging, and the fatal-startup-error exit path
//! (spec §1 treats this as an external collaborator, kept intentionally
//! minimal). Everything else lives in the library crate.

use kvrs::config::Config;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "fatal: invalid startup arguments");
            std::process::exit(1);
        }
    };

    if let Err(e) = kvrs::event_loop::run(config) {
        tracing::error!(error = %e, "fatal: server exited");
        std::process::exit(1);
    }
}
