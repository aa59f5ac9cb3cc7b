use vault_raft_snapshot_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
