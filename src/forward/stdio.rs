//! Standard input/output forwarding, for use as an SSH ProxyCommand

use super::bridge;
use crate::tunnel::SessionBuilder;
use tracing::info;

/// Bridge the process's stdin and stdout through one tunnel session
pub async fn run_stdio(builder: &SessionBuilder) -> crate::Result<()> {
    info!("Forwarding stdin/stdout to {:?}", builder.target().destination);
    bridge(tokio::io::stdin(), tokio::io::stdout(), builder).await
}
