use clap::Parser;
use functions_e2e::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    functions_e2e::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cli::execute_run(args).await?,
        Commands::List => cli::execute_list(),
        Commands::Setup(args) => cli::execute_setup(args).await?,
        Commands::Teardown(args) => cli::execute_teardown(args).await?,
    }

    Ok(())
}
