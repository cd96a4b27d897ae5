use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cli = pennant_cli::Cli::parse();
    pennant_cli::run_cli(cli)
}
