//! Command-line interface for `rsbak`.
//!
//! Thin glue: parse arguments, resolve the destination address, obtain
//! passwords, and hand off to `rsbak_core::sync`. The retry policy for
//! authentication/transport-setup failures (spec.md §7: up to 5 attempts)
//! lives here rather than in the library, since it's the CLI that owns the
//! interactive password prompt.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use rsbak_core::address::{self, Destination};
use rsbak_core::error::BackupError;
use rsbak_core::sync::{run_backup, run_restore, BackupOptions, RestoreOptions};
use rsbak_core::transport::local::LocalTransport;
#[cfg(feature = "sftp")]
use rsbak_core::transport::sftp::SftpTransport;
use rsbak_core::transport::Transport;

const MAX_AUTH_ATTEMPTS: u32 = 5;

/// Encrypted-at-rest remote backup and restore.
#[derive(Parser)]
#[command(name = "rsbak")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Back up a directory to a local destination
    rsbak backup ~/photos /mnt/backup-drive

    # Back up to a remote host over SFTP, excluding a couple of patterns
    rsbak backup ~/photos alice@backup.example.com:/srv/photos '[\"node_modules\",\".cache\"]'

    # Restore everything
    rsbak restore alice@backup.example.com:/srv/photos ~/restored

    # Preview what a restore would touch without writing anything
    rsbak restore alice@backup.example.com:/srv/photos ~/restored --list-only
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Worker threads for uploads/downloads
    #[arg(long, global = true, default_value_t = rsbak_core::workerpool::DEFAULT_WORKERS)]
    workers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a remote or local destination up to date with a local tree
    Backup {
        /// Local directory to back up
        src: PathBuf,
        /// Destination: a local path, or `user@host:/path` for SFTP
        dest: String,
        /// JSON array of substrings; any local path containing one is skipped
        exclusions: Option<String>,
    },
    /// Reconstruct a local tree from a remote or local destination
    Restore {
        /// Source: a local path, or `user@host:/path` for SFTP
        src: String,
        /// Local directory to restore into
        dest: PathBuf,
        /// Only restore paths matching this regex
        #[arg(long)]
        include: Option<String>,
        /// Skip paths matching this regex
        #[arg(long)]
        exclude: Option<String>,
        /// Print the paths that would be restored and exit
        #[arg(long)]
        list_only: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Backup {
            src,
            dest,
            exclusions,
        } => backup(src, dest, exclusions.as_deref().unwrap_or(""), cli.workers),
        Commands::Restore {
            src,
            dest,
            include,
            exclude,
            list_only,
        } => restore(
            src,
            dest,
            include.as_deref(),
            exclude.as_deref(),
            *list_only,
            cli.workers,
        ),
    }
}

fn backup(src: &Path, dest: &str, exclusions: &str, workers: usize) -> Result<()> {
    if !src.is_dir() {
        anyhow::bail!(
            "{}",
            BackupError::Usage(format!("source directory does not exist: {}", src.display()))
        );
    }
    let exclusions = parse_exclusions(exclusions)?;

    let password = prompt_password_confirmed("Encryption password")?;
    let transport = connect_with_retry(dest)?;

    let options = BackupOptions {
        exclusions,
        workers,
    };
    let report = run_backup(src, transport.as_ref(), &password, &options)?;

    println!(
        "backup complete: {} unchanged, {} deduplicated, {} uploaded, {} tombstoned, {} orphan chunks removed",
        report.unchanged, report.deduplicated, report.uploaded, report.tombstoned, report.orphans_removed,
    );
    Ok(())
}

fn restore(
    src: &str,
    dest: &Path,
    include: Option<&str>,
    exclude: Option<&str>,
    list_only: bool,
    workers: usize,
) -> Result<()> {
    let password = prompt_password_confirmed("Encryption password")?;
    let transport = connect_with_retry(src)?;

    let options = RestoreOptions {
        include: include.map(Regex::new).transpose().context("invalid --include regex")?,
        exclude: exclude.map(Regex::new).transpose().context("invalid --exclude regex")?,
        stop_on_filter_mismatch: false,
        list_only,
        workers,
    };

    if !list_only {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("creating restore destination {}", dest.display()))?;
    }

    let report = run_restore(transport.as_ref(), dest, &password, &options)?;

    if list_only {
        for path in &report.listed_paths {
            println!("{path}");
        }
        return Ok(());
    }

    println!(
        "restore complete: {} restored, {} unchanged, {} filtered out, {} corrupted manifest records skipped, {} files failed",
        report.restored,
        report.skipped_unchanged,
        report.skipped_filtered,
        report.corrupted_records,
        report.failed,
    );
    Ok(())
}

fn parse_exclusions(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).context("exclusion list must be a JSON array of strings")
}

/// Resolve `dest` to a transport, retrying authentication/setup failures
/// against a freshly re-prompted password up to [`MAX_AUTH_ATTEMPTS`] times
/// (spec.md §7).
fn connect_with_retry(dest: &str) -> Result<Box<dyn Transport>> {
    match address::parse(dest) {
        Destination::Local(path) => Ok(Box::new(LocalTransport::new(path)?)),
        Destination::Remote(addr) => {
            #[cfg(feature = "sftp")]
            {
                let mut sftp_password = sftp_password()?;
                for attempt in 1..=MAX_AUTH_ATTEMPTS {
                    match SftpTransport::connect(addr.clone(), &sftp_password) {
                        Ok(transport) => return Ok(Box::new(transport)),
                        Err(e) if attempt < MAX_AUTH_ATTEMPTS => {
                            tracing::warn!(attempt, "connection failed: {e}, retrying");
                            eprintln!("Connection failed: {e}");
                            sftp_password = rpassword::prompt_password(format!(
                                "SFTP password for {}@{} ",
                                addr.user, addr.host
                            ))?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                unreachable!("loop always returns by the final attempt")
            }
            #[cfg(not(feature = "sftp"))]
            {
                let _ = addr;
                anyhow::bail!(
                    "{}",
                    BackupError::Usage("this build was compiled without SFTP support".to_string())
                )
            }
        }
    }
}

#[cfg(feature = "sftp")]
fn sftp_password() -> Result<String> {
    if let Ok(password) = std::env::var("RSBAK_SFTP_PASSWORD") {
        return Ok(password);
    }
    Ok(rpassword::prompt_password("SFTP password: ")?)
}

/// Prompt for a password twice, requiring the two entries to match, per
/// spec.md §6 ("the encryption password is prompted twice for
/// confirmation, for backup and restore alike"). `RSBAK_PASSWORD`
/// bypasses the prompt entirely.
fn prompt_password_confirmed(label: &str) -> Result<String> {
    if let Ok(password) = std::env::var("RSBAK_PASSWORD") {
        return Ok(password);
    }

    if !io::stdin().is_terminal() {
        anyhow::bail!(
            "{}",
            BackupError::Usage(
                "no RSBAK_PASSWORD set and stdin is not a terminal to prompt on".to_string()
            )
        );
    }

    loop {
        let first = rpassword::prompt_password(format!("{label}: "))?;
        let second = rpassword::prompt_password(format!("{label} (confirm): "))?;
        if first == second {
            return Ok(first);
        }
        eprintln!("Passwords did not match, try again.");
    }
}

fn setup_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
