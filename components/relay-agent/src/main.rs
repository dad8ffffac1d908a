use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = relay_agent::instrumentation::tracing::init_tracing();
    relay_agent::instrumentation::tracing::init_panic_handler();

    // The entrypoint only delegates to the CLI layer, which parses the
    // command and dispatches into the runtime.
    relay_agent::cli::cli::run().await
}
