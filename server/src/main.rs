#[tokio::main]
async fn main() -> anyhow::Result<()> {
    studio_server::run().await
}
