use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chquery::{CompileRequest, Compiler, parse_query};

#[derive(Parser)]
#[command(name = "chquery")]
#[command(about = "Compile templated ClickHouse queries into plain SQL")]
struct Cli {
    /// TOML file with options, variables, time range and ad-hoc filters
    #[arg(short, long)]
    request: PathBuf,

    /// Query template; read from stdin when omitted
    #[arg(short, long)]
    query: Option<PathBuf>,

    /// Print the parsed clause tree instead of compiling
    #[arg(long)]
    ast: bool,
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chquery=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let request = CompileRequest::from_file(&cli.request)?;

    let template = match &cli.query {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read query from stdin")?;
            input
        }
    };

    if cli.ast {
        println!("{:#?}", parse_query(&template)?);
        return Ok(());
    }

    let sql = Compiler::new(&request).compile(&template)?;
    tracing::info!(bytes = sql.len(), "query compiled");
    println!("{sql}");
    Ok(())
}
