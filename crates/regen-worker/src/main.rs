//! reGen worker process.
//!
//! Spawned by the supervisor with stdin/stdout as its control channel. The
//! first frame on stdin is a `Hello` naming the worker kind. Logs go to
//! stderr so they never mix with the framed protocol on stdout.

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("REGEN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = regen_core::worker::run_from_stdio();
    if code != 0 {
        tracing::debug!(code, "Worker exiting with failure status");
    }
    std::process::exit(code)
}
