use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vertigo::run(vertigo::Cli::parse()).await
}
