use clap::Parser;
use databridge::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = cli.settings()?;
    cli.init_logging(&settings)?;

    cli.execute(&settings).await?;

    Ok(())
}
