#[tokio::main]
async fn main() -> anyhow::Result<()> {
    duocall::run().await
}
