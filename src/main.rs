//! Muster control plane binary

use muster::init_logging;

#[tokio::main]
async fn main() {
    init_logging();
    let code = muster::cli::run().await;
    std::process::exit(code);
}
