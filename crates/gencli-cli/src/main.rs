//! gencli: describe your files with a generative model, then search them

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gencli_core::index::ProgressEvent;
use gencli_core::{
    CancelFlag, Config, ConfigEdit, FileRecord, FingerprintStore, Indexer, Searcher, paths,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "gencli")]
#[command(about = "Model-described file indexing and semantic search", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory (default: $GENCLI_HOME or the platform config dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Search query (when no subcommand is given)
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe and embed new files in the configured directories
    Index,

    /// Find the indexed file that best matches a query
    Search {
        /// Open the best match in its default application
        #[arg(long)]
        open: bool,

        /// Search query
        query: Vec<String>,
    },

    /// List every indexed file
    List,

    /// Show or change the configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Directory to index
    #[arg(long = "add-dir", value_name = "DIR")]
    add_dirs: Vec<PathBuf>,

    #[arg(long = "remove-dir", value_name = "DIR")]
    remove_dirs: Vec<PathBuf>,

    /// File name suffix to skip, e.g. ".log"
    #[arg(long = "add-skip-type", value_name = "SUFFIX")]
    add_skip_types: Vec<String>,

    #[arg(long = "remove-skip-type", value_name = "SUFFIX")]
    remove_skip_types: Vec<String>,

    /// File name prefix to skip, e.g. "."
    #[arg(long = "add-skip-file", value_name = "PREFIX")]
    add_skip_files: Vec<String>,

    #[arg(long = "remove-skip-file", value_name = "PREFIX")]
    remove_skip_files: Vec<String>,

    #[arg(long = "add-api-key", value_name = "KEY")]
    add_api_keys: Vec<String>,

    #[arg(long = "remove-api-key", value_name = "KEY")]
    remove_api_keys: Vec<String>,

    /// Minimum similarity for a search hit
    #[arg(long)]
    threshold: Option<f32>,

    /// Print the configuration without changing it
    #[arg(long)]
    show: bool,
}

impl ConfigArgs {
    fn is_empty(&self) -> bool {
        self.add_dirs.is_empty()
            && self.remove_dirs.is_empty()
            && self.add_skip_types.is_empty()
            && self.remove_skip_types.is_empty()
            && self.add_skip_files.is_empty()
            && self.remove_skip_files.is_empty()
            && self.add_api_keys.is_empty()
            && self.remove_api_keys.is_empty()
            && self.threshold.is_none()
    }

    fn into_edit(self) -> ConfigEdit {
        ConfigEdit {
            add_directories: self.add_dirs,
            remove_directories: self.remove_dirs,
            add_skip_types: self.add_skip_types,
            remove_skip_types: self.remove_skip_types,
            add_skip_files: self.add_skip_files,
            remove_skip_files: self.remove_skip_files,
            add_api_keys: self.add_api_keys,
            remove_api_keys: self.remove_api_keys,
            relevance_threshold: self.threshold,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let home = paths::resolve_home(cli.home.as_deref())?;

    match cli.command {
        Some(Commands::Index) => cmd_index(home).await?,
        Some(Commands::Search { query, open }) => {
            cmd_search(home, &query.join(" "), open).await?
        }
        Some(Commands::List) => cmd_list(&home)?,
        Some(Commands::Config(args)) => cmd_config(&home, args)?,
        None => {
            if cli.query.is_empty() {
                println!("Usage: gencli <query> or gencli <command>");
                println!("Run 'gencli --help' for more information.");
            } else {
                cmd_search(home, &cli.query.join(" "), false).await?;
            }
        }
    }

    Ok(())
}

async fn cmd_index(home: PathBuf) -> Result<()> {
    let fingerprints_path = paths::fingerprints_path(&home);
    let fingerprints = FingerprintStore::load(&fingerprints_path)
        .with_context(|| format!("Failed to read {}", fingerprints_path.display()))?;

    let cancel = CancelFlag::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after in-flight requests");
                cancel.cancel();
            }
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message("Scanning files...");

    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("█▓░");

    let mut indexer = Indexer::open(home)
        .context("Cannot index; see `gencli config --help`")?
        .with_cancel(cancel);

    indexer.set_progress_callback(Box::new({
        let pb = pb.clone();
        move |event| match event {
            ProgressEvent::Scanning { count } => {
                pb.set_message(format!("Scanning... {} files found", count));
            }
            ProgressEvent::Describing {
                current,
                total,
                name,
            } => {
                pb.set_style(bar_style.clone());
                pb.set_length(total as u64);
                pb.set_position(current as u64);
                pb.set_message(format!("described {}", name));
            }
            ProgressEvent::Embedding { current, total } => {
                pb.set_length(total as u64);
                pb.set_position(current as u64);
                pb.set_message("embedding descriptions");
            }
        }
    }));

    let result = indexer.index(&fingerprints).await;
    pb.finish_and_clear();
    let stats = result?;

    fingerprints
        .save(&fingerprints_path)
        .with_context(|| format!("Failed to write {}", fingerprints_path.display()))?;

    println!("✓ Indexing complete:");
    println!("  Files scanned:     {}", stats.scanned);
    println!("  Files unchanged:   {}", stats.carried);
    println!("  Files new:         {}", stats.new);
    println!("  Files removed:     {}", stats.removed);
    if stats.skipped > 0 {
        println!("  Files skipped:     {}", stats.skipped);
    }
    println!(
        "  Descriptions:      {} ({} failed)",
        stats.described, stats.description_failures
    );
    println!(
        "  Embeddings:        {} ({} failed)",
        stats.embedded, stats.embedding_failures
    );

    Ok(())
}

async fn cmd_search(home: PathBuf, query: &str, open: bool) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("Empty query");
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message("Searching...");

    let searcher = Searcher::open(home)?;
    let result = searcher.search(query).await;

    pb.finish_and_clear();

    match result? {
        Some(hit) => {
            println!(
                "\x1b[1m{}\x1b[0m  \x1b[32m{:.3}\x1b[0m",
                hit.record.path().display(),
                hit.similarity
            );
            println!("{}", hit.record.description);
            if open {
                open_file(&hit.record.path())?;
            }
        }
        None => println!("No matching file found for: {}", query),
    }

    Ok(())
}

/// Launch `path` in the platform's default application without waiting.
fn open_file(path: &Path) -> Result<()> {
    let Some(mut command) = opener_command(path) else {
        anyhow::bail!("Opening files is not supported on this platform");
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(())
}

fn opener_command(path: &Path) -> Option<Command> {
    let program = if cfg!(target_os = "windows") {
        "explorer"
    } else if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "linux") {
        "xdg-open"
    } else {
        return None;
    };
    let mut command = Command::new(program);
    command.arg(path);
    Some(command)
}

fn cmd_list(home: &Path) -> Result<()> {
    let records = gencli_core::index::list(home)?;
    if records.is_empty() {
        println!("Index is empty. Run 'gencli index' first.");
        return Ok(());
    }

    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &FileRecord) {
    println!(
        "\x1b[1;36m[{}]\x1b[0m \x1b[1m{}\x1b[0m",
        record.id,
        record.path().display()
    );
    if record.has_description() {
        println!("    {}", record.description);
    } else {
        println!("    \x1b[2m(no description)\x1b[0m");
    }
}

fn cmd_config(home: &Path, args: ConfigArgs) -> Result<()> {
    let config = if args.show || (args.is_empty() && paths::config_path(home).exists()) {
        Config::load(home)?
    } else {
        let config = Config::edit(home, args.into_edit())?;
        println!("Saved {}", paths::config_path(home).display());
        config
    };

    print_config(home, &config);
    Ok(())
}

fn print_config(home: &Path, config: &Config) {
    println!("gencli home: {}", home.display());
    println!();
    println!("Directories:");
    for dir in &config.directories {
        println!("  {}", dir.display());
    }
    println!("Skip types:  {}", config.skip_types.join(", "));
    println!("Skip files:  {}", config.skip_files.join(", "));
    println!("Threshold:   {}", config.relevance_threshold);
    println!("Models:      {} / {}", config.describe_model, config.embed_model);
    println!("Concurrency: {}", config.concurrency);
    println!("API keys:    {}", config.api_keys.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_open_flag_parses() {
        let cli = Cli::try_parse_from(["gencli", "search", "--open", "tax", "return"]).unwrap();
        match cli.command {
            Some(Commands::Search { open, query }) => {
                assert!(open);
                assert_eq!(query, vec!["tax", "return"]);
            }
            _ => panic!("expected search"),
        }

        let cli = Cli::try_parse_from(["gencli", "search", "tax"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Search { open: false, .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_opener_uses_xdg_open_on_linux() {
        let path = Path::new("/data/a.txt");
        let command = opener_command(path).unwrap();
        assert_eq!(command.get_program(), "xdg-open");
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec![path.as_os_str()]);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_opener_uses_open_on_macos() {
        let command = opener_command(Path::new("/data/a.txt")).unwrap();
        assert_eq!(command.get_program(), "open");
    }
}
