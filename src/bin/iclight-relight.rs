//! iclight-relight CLI tool
//!
//! Batch portrait relighting over a directory of PNG images.

#[cfg(feature = "cli")]
use iclight_relight::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
