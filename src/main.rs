use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(name = "dyntest")]
#[command(about = "Generate, run and refine test cases for dynamic content sections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Enable verbose debug output")]
    verbose: bool,

    #[arg(long, global = true, help = "Build backend requests and print them without sending")]
    dry_run: bool,

    #[arg(long, global = true, help = "Path to the project configuration (defaults to dyntest.yml)")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Markup,
    Script,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Infer the variables a section file uses")]
    Analyze {
        #[arg(help = "Section source file")]
        file: PathBuf,
        #[arg(long, value_enum, help = "Section kind (inferred from the extension when omitted)")]
        kind: Option<KindArg>,
    },

    #[command(about = "Run every test case of a document")]
    Run {
        #[arg(help = "Document file (.json, .yml or .yaml)")]
        document: PathBuf,
    },

    #[command(about = "Generate test cases for the sections of a document")]
    Generate {
        #[arg(help = "Document file (.json, .yml or .yaml)")]
        document: PathBuf,
        #[arg(long = "section", help = "Only generate for these section ids")]
        sections: Vec<String>,
        #[arg(long, help = "Number of test cases to ask for per section")]
        count: Option<usize>,
        #[arg(long, help = "Append accepted test cases to the document")]
        write: bool,
    },

    #[command(about = "Ask the backend to repair failing test cases of a section")]
    Refine {
        #[arg(help = "Document file (.json, .yml or .yaml)")]
        document: PathBuf,
        #[arg(long, help = "Section id")]
        section: String,
        #[arg(long = "test", help = "Only refine these test cases")]
        tests: Vec<String>,
        #[arg(long, help = "Replace the refined test cases in the document")]
        write: bool,
    },

    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    #[command(about = "Remove every cached backend response")]
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = cli::Config {
        verbose: cli.verbose,
        dry_run: cli.dry_run,
        config_path: cli.config,
    };

    match cli.command {
        Commands::Analyze { file, kind } => {
            let kind = kind.map(|k| match k {
                KindArg::Markup => dyntest::data::SectionKind::Markup,
                KindArg::Script => dyntest::data::SectionKind::Script,
            });
            cli::analyze(&file, kind, &config)?;
        }
        Commands::Run { document } => {
            cli::run(&document, &config).await?;
        }
        Commands::Generate {
            document,
            sections,
            count,
            write,
        } => {
            cli::generate(&document, sections, count, write, &config).await?;
        }
        Commands::Refine {
            document,
            section,
            tests,
            write,
        } => {
            cli::refine(&document, &section, tests, write, &config).await?;
        }
        Commands::Cache(CacheCommands::Clear) => {
            cli::clear_cache(&config)?;
        }
    }

    Ok(())
}
