// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use statpkg::install::{PackageSettings, PlanAction};
use statpkg::nexus::{PackageOverride, RepositorySettings};
use statpkg::repository::{RepositoryReference, SourceVariant};
use statpkg::resolver::DependencyPolicy;
use statpkg::{CancelToken, Config, ops};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/statpkg/statpkg.db";
const DEFAULT_CACHE: &str = "/var/cache/statpkg";

#[derive(Parser)]
#[command(name = "statpkg")]
#[command(author, version, about = "Multi-repository R package installer with parallel builds and rollback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what an install would do without changing the library
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Install packages and their dependencies into a library
    Install {
        #[command(flatten)]
        run: RunArgs,
        /// Database path for the install history
        #[arg(short, long, env = "STATPKG_DB", default_value = DEFAULT_DB_PATH)]
        db_path: PathBuf,
        /// Do not record this run in the install history
        #[arg(long)]
        no_history: bool,
    },
    /// Show install history
    History {
        /// Database path (default: /var/lib/statpkg/statpkg.db)
        #[arg(short, long, env = "STATPKG_DB", default_value = DEFAULT_DB_PATH)]
        db_path: PathBuf,
        /// Also list the packages of each run
        #[arg(short, long)]
        verbose: bool,
    },
    /// Restore backups left behind by an interrupted install
    Recover {
        /// Package library
        #[arg(short, long, env = "STATPKG_LIBRARY")]
        library: PathBuf,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Packages to install
    packages: Vec<String>,

    /// Package library
    #[arg(short, long, env = "STATPKG_LIBRARY")]
    library: PathBuf,

    /// Repository as NAME=LOCATION, in search order
    #[arg(short, long = "repo", value_name = "NAME=LOCATION", env = "STATPKG_REPOS", value_delimiter = ',', value_parser = parse_pair)]
    repos: Vec<(String, String)>,

    /// Extra source tarball to install
    #[arg(short, long = "source", value_name = "TARBALL")]
    sources: Vec<PathBuf>,

    /// Cache directory for catalogs, downloads and unpacked sources
    #[arg(long, env = "STATPKG_CACHE", default_value = DEFAULT_CACHE)]
    cache: PathBuf,

    /// Replace outdated packages
    #[arg(short, long)]
    update: bool,

    /// Fail instead of creating a missing library
    #[arg(long)]
    strict: bool,

    /// Also install suggested packages
    #[arg(long)]
    suggests: bool,

    /// Preferred variant when nothing more specific is set
    #[arg(long, default_value = "source", value_parser = parse_variant)]
    variant: SourceVariant,

    /// Take a package only from one repository, as PACKAGE=REPO
    #[arg(long = "pin", value_name = "PACKAGE=REPO", value_parser = parse_pair)]
    pins: Vec<(String, String)>,

    /// Variant for one package, as PACKAGE=VARIANT
    #[arg(long = "package-variant", value_name = "PACKAGE=VARIANT", value_parser = parse_pair)]
    package_variants: Vec<(String, String)>,

    /// Default variant for one repository, as REPO=VARIANT
    #[arg(long = "repo-variant", value_name = "REPO=VARIANT", value_parser = parse_pair)]
    repo_variants: Vec<(String, String)>,

    /// Update this package when outdated even without --update
    #[arg(long = "force-update", value_name = "PACKAGE")]
    force_update: Vec<String>,

    /// Worker threads (default: CPU count minus one)
    #[arg(short = 'j', long, env = "STATPKG_THREADS")]
    threads: Option<usize>,

    /// Language version used for binary repository paths
    #[arg(long, env = "STATPKG_R_VERSION", default_value = statpkg::config::DEFAULT_LANGUAGE_VERSION)]
    language_version: String,

    /// R executable used to build packages
    #[arg(long, env = "STATPKG_R", default_value = "R")]
    r_executable: PathBuf,

    /// Per-package build timeout in seconds
    #[arg(long)]
    build_timeout: Option<u64>,

    /// Overall deadline for the run in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Catalog cache freshness in seconds
    #[arg(long)]
    catalog_ttl: Option<u64>,
}

fn parse_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn parse_variant(s: &str) -> std::result::Result<SourceVariant, String> {
    s.parse()
}

impl RunArgs {
    fn config(&self) -> Result<Config> {
        let mut config = Config::new(&self.library, &self.cache);
        config.repositories = self
            .repos
            .iter()
            .map(|(name, location)| RepositoryReference::new(name.clone(), location.clone()))
            .collect();
        config.update = self.update;
        config.strict = self.strict;
        if self.suggests {
            config.dependencies = DependencyPolicy::with_suggests();
        }
        config.nexus.default_variant = self.variant;

        for (package, repository) in &self.pins {
            config
                .nexus
                .overrides
                .entry(package.clone())
                .or_insert_with(PackageOverride::default)
                .repository = Some(repository.clone());
        }
        for (package, variant) in &self.package_variants {
            let variant = parse_variant(variant).map_err(anyhow::Error::msg)?;
            config
                .nexus
                .overrides
                .entry(package.clone())
                .or_insert_with(PackageOverride::default)
                .variant = Some(variant);
        }
        for (repository, variant) in &self.repo_variants {
            let variant = parse_variant(variant).map_err(anyhow::Error::msg)?;
            config.nexus.repositories.insert(
                repository.clone(),
                RepositorySettings {
                    default_variant: Some(variant),
                },
            );
        }
        for package in &self.force_update {
            config
                .packages
                .entry(package.clone())
                .or_insert_with(PackageSettings::default)
                .force_update = true;
        }

        config.engine.threads = self.threads;
        config.language_version = self.language_version.clone();
        config.r_executable = self.r_executable.clone();
        config.build_timeout = self.build_timeout;
        config.catalog_ttl = self.catalog_ttl;
        config.validate()?;
        Ok(config)
    }

    fn cancel_token(&self) -> CancelToken {
        match self.timeout {
            Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
            None => CancelToken::new(),
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Plan { run }) => {
            let config = run.config()?;
            let plan = ops::plan(&config, run.packages.as_slice(), &run.sources, &run.cancel_token())?;

            if plan.create_library {
                println!("Library {} will be created", plan.library.display());
            }
            for (depth, layer) in plan.layers.iter().enumerate() {
                println!("Layer {}:", depth + 1);
                for name in layer {
                    let Some(package) = plan.package(name) else {
                        continue;
                    };
                    let installed = package
                        .installed_version
                        .as_deref()
                        .map(|v| format!(" (installed {})", v))
                        .unwrap_or_default();
                    println!(
                        "  {:<7} {} {} [{} {}]{}",
                        package.action.as_str(),
                        package.name,
                        package.version,
                        package.repository,
                        package.variant,
                        installed
                    );
                }
            }
            for outdated in plan.outdated.iter().filter(|o| !o.scheduled) {
                println!(
                    "Outdated but kept: {} {} (available {})",
                    outdated.name, outdated.installed, outdated.available
                );
            }

            let work = plan
                .packages
                .values()
                .filter(|p| p.action != PlanAction::Skip)
                .count();
            println!("\n{} package(s) to install or update", work);
            Ok(())
        }
        Some(Commands::Install {
            run,
            db_path,
            no_history,
        }) => {
            let mut config = run.config()?;
            if !no_history {
                config.db_path = Some(db_path);
            }

            let tool = config.build_tool();
            let summary = ops::install(
                &config,
                run.packages.as_slice(),
                &run.sources,
                &tool,
                &run.cancel_token(),
            )?;

            if !summary.recovered.is_empty() {
                println!("Recovered from interrupted run: {}", summary.recovered.join(", "));
            }
            match &summary.report {
                None => println!("All requested packages are installed and current."),
                Some(report) => {
                    let installed = report.installed();
                    println!("Installed {} package(s)", installed.len());
                    for name in &installed {
                        if let Some(package) = summary.plan.package(name) {
                            println!("  {} {} [{}]", package.name, package.version, package.repository);
                        }
                    }
                    if let Some(id) = summary.run_id {
                        info!("Recorded as run {}", id);
                    }
                }
            }
            Ok(())
        }
        Some(Commands::History { db_path, verbose }) => {
            let runs = ops::history(&db_path)
                .with_context(|| format!("reading history from {}", db_path.display()))?;

            if runs.is_empty() {
                println!("No install history.");
            } else {
                println!("Install history:");
                for (run, packages) in &runs {
                    let timestamp = run
                        .finished_at
                        .as_ref()
                        .or(run.created_at.as_ref())
                        .map(|s| s.as_str())
                        .unwrap_or("pending");

                    println!(
                        "  [{}] {} - {} into {} ({})",
                        run.id.unwrap_or_default(),
                        timestamp,
                        run.description,
                        run.library,
                        run.status.as_str()
                    );
                    if let Some(error) = &run.error {
                        println!("      error: {}", error);
                    }
                    if verbose {
                        for package in packages {
                            println!(
                                "      {} {} {} [{} {}] {}",
                                package.action,
                                package.name,
                                package.version,
                                package.repository,
                                package.variant,
                                package.outcome.as_str()
                            );
                        }
                    }
                }
                println!("\nTotal: {} run(s)", runs.len());
            }

            Ok(())
        }
        Some(Commands::Recover { library }) => {
            let config = Config::new(&library, DEFAULT_CACHE);
            let restored = ops::recover(&config)?;
            if restored.is_empty() {
                println!("Nothing to recover in {}", library.display());
            } else {
                println!("Restored: {}", restored.join(", "));
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "statpkg", &mut std::io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("statpkg v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'statpkg --help' for usage information");
            Ok(())
        }
    }
}
