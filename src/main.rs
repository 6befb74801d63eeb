//! relock CLI - reentrant mutex lock analysis for Go projects.
//!
//! Discovers Go packages under a path (one per directory), analyzes each,
//! and prints the findings. Exits 1 when findings exist so the tool can
//! gate CI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

use relock::{analyze, discover, Finding, Package};

/// Reentrant mutex lock analysis for Go.
///
/// Flags locks acquired while the same mutex is already held (directly,
/// via wrapper methods, or through transitive calls on the same receiver)
/// and early returns that leak a held lock.
#[derive(Parser)]
#[command(name = "relock", version, about)]
struct Cli {
    /// File or directory to analyze (packages are directories of .go files)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Import path used for a single-file analysis
    #[arg(long)]
    package_path: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(true) => ExitCode::from(1),
        Ok(false) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("relock: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether any findings were reported.
fn run(cli: &Cli) -> Result<bool> {
    let packages = load_packages(cli)?;

    let analyzed: Vec<(Package, Vec<Finding>)> = packages
        .into_par_iter()
        .map(|pkg| {
            let findings = analyze(&pkg);
            (pkg, findings)
        })
        .collect();

    let mut any = false;
    match cli.format {
        OutputFormat::Text => {
            for (pkg, findings) in &analyzed {
                if !findings.is_empty() {
                    any = true;
                    print!("{}", relock::render_text(pkg, findings));
                }
            }
        }
        OutputFormat::Json => {
            let all: Vec<&Finding> = analyzed.iter().flat_map(|(_, f)| f).collect();
            any = !all.is_empty();
            let all: Vec<Finding> = all.into_iter().cloned().collect();
            println!("{}", relock::render_json(&all)?);
        }
    }
    Ok(any)
}

fn load_packages(cli: &Cli) -> Result<Vec<Package>> {
    if cli.path.is_file() {
        let file = relock::SourceFile::read(&cli.path)
            .with_context(|| format!("loading {}", cli.path.display()))?;
        let import_path = cli.package_path.clone().unwrap_or_else(|| {
            cli.path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "main".to_string())
        });
        Ok(vec![Package {
            import_path,
            files: vec![file],
        }])
    } else {
        discover(&cli.path).with_context(|| format!("scanning {}", cli.path.display()))
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "relock=warn",
        1 => "relock=info",
        2 => "relock=debug",
        _ => "relock=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
