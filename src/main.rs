#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolbridge::run().await
}
