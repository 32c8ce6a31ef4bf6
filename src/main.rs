use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    flowprobe::cli::app::run().await
}
