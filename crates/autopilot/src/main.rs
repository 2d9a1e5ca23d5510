use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    autopilot::cli::main().await
}
