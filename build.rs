// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn run_args(cmd: Command) -> Command {
    cmd.arg(Arg::new("packages").num_args(0..).help("Packages to install"))
        .arg(
            Arg::new("library")
                .short('l')
                .long("library")
                .value_name("PATH")
                .required(true)
                .help("Package library (env: STATPKG_LIBRARY)"),
        )
        .arg(
            Arg::new("repo")
                .short('r')
                .long("repo")
                .value_name("NAME=LOCATION")
                .action(ArgAction::Append)
                .help("Repository, in search order (env: STATPKG_REPOS)"),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("TARBALL")
                .action(ArgAction::Append)
                .help("Extra source tarball to install"),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .default_value("/var/cache/statpkg")
                .help("Cache directory (env: STATPKG_CACHE)"),
        )
        .arg(
            Arg::new("update")
                .short('u')
                .long("update")
                .action(ArgAction::SetTrue)
                .help("Replace outdated packages"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Fail instead of creating a missing library"),
        )
        .arg(
            Arg::new("suggests")
                .long("suggests")
                .action(ArgAction::SetTrue)
                .help("Also install suggested packages"),
        )
        .arg(
            Arg::new("variant")
                .long("variant")
                .value_parser(["source", "binary"])
                .default_value("source")
                .help("Preferred variant when nothing more specific is set"),
        )
        .arg(
            Arg::new("pin")
                .long("pin")
                .value_name("PACKAGE=REPO")
                .action(ArgAction::Append)
                .help("Take a package only from one repository"),
        )
        .arg(
            Arg::new("package_variant")
                .long("package-variant")
                .value_name("PACKAGE=VARIANT")
                .action(ArgAction::Append)
                .help("Variant for one package"),
        )
        .arg(
            Arg::new("repo_variant")
                .long("repo-variant")
                .value_name("REPO=VARIANT")
                .action(ArgAction::Append)
                .help("Default variant for one repository"),
        )
        .arg(
            Arg::new("force_update")
                .long("force-update")
                .value_name("PACKAGE")
                .action(ArgAction::Append)
                .help("Update this package when outdated even without --update"),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .help("Worker threads (env: STATPKG_THREADS)"),
        )
        .arg(
            Arg::new("language_version")
                .long("language-version")
                .default_value("4.3")
                .help("Language version used for binary repository paths"),
        )
        .arg(
            Arg::new("r_executable")
                .long("r-executable")
                .default_value("R")
                .help("R executable used to build packages (env: STATPKG_R)"),
        )
        .arg(Arg::new("build_timeout").long("build-timeout").help("Per-package build timeout in seconds"))
        .arg(Arg::new("timeout").long("timeout").help("Overall deadline for the run in seconds"))
        .arg(Arg::new("catalog_ttl").long("catalog-ttl").help("Catalog cache freshness in seconds"))
}

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value("/var/lib/statpkg/statpkg.db")
        .help("Database path (env: STATPKG_DB)")
}

fn build_cli() -> Command {
    Command::new("statpkg")
        .version(env!("CARGO_PKG_VERSION"))
        .author("statpkg Contributors")
        .about("Multi-repository R package installer with parallel builds and rollback")
        .subcommand_required(false)
        .subcommand(run_args(
            Command::new("plan").about("Show what an install would do without changing the library"),
        ))
        .subcommand(
            run_args(Command::new("install").about("Install packages and their dependencies into a library"))
                .arg(db_path_arg())
                .arg(
                    Arg::new("no_history")
                        .long("no-history")
                        .action(ArgAction::SetTrue)
                        .help("Do not record this run in the install history"),
                ),
        )
        .subcommand(
            Command::new("history")
                .about("Show install history")
                .arg(db_path_arg())
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Also list the packages of each run"),
                ),
        )
        .subcommand(
            Command::new("recover")
                .about("Restore backups left behind by an interrupted install")
                .arg(
                    Arg::new("library")
                        .short('l')
                        .long("library")
                        .required(true)
                        .help("Package library"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell", "elvish"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("statpkg.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
