use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use xsmpd::codec::AutostartDirs;
use xsmpd::daemon::config::Config;
use xsmpd::{consts, daemon};

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    #[clap(short, long, action = clap::ArgAction::Count,
           help = "show more in logs, may be provided multiple times")]
    verbose: u8,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(help = "runs the session-management protocol engine")]
    Daemon {
        #[clap(short, long, action, help = "a toml file containing configuration")]
        config_file: Option<String>,
        #[clap(short, long, action, help = "path of the XSMP listening socket")]
        socket: Option<String>,
    },
    #[clap(help = "lists the autostart desktop entries this engine would restore clients from")]
    ListAutostart,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Daemon { config_file, socket } => {
            let config = Config::load(config_file.as_deref())?;
            init_logging(args.verbose, config.log_level.as_deref());
            let socket = socket
                .map(PathBuf::from)
                .unwrap_or_else(default_socket_path);
            daemon::run(config, socket)
        }
        Commands::ListAutostart => {
            init_logging(args.verbose, None);
            list_autostart()
        }
    }
}

/// `--verbose` always wins over the config file; absent either, falls
/// back to "info".
fn init_logging(verbose: u8, config_level: Option<&str>) {
    let level = match verbose {
        0 => config_level.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime_dir.join(consts::DEFAULT_SOCKET_NAME)
}

fn list_autostart() -> anyhow::Result<()> {
    let dirs = AutostartDirs::from_env();
    for entry in xsmpd::codec::read_entries(&dirs) {
        let name = entry.name.as_deref().unwrap_or("(untitled)");
        println!("{}\t{}", name, entry.path.display());
        if let Some(exec) = &entry.exec {
            println!("  Exec: {}", exec);
        }
        if let Some(comment) = &entry.comment {
            println!("  Comment: {}", comment);
        }
        if let Some(discard) = &entry.discard_command {
            println!("  Discard: {}", discard);
        }
    }
    Ok(())
}
