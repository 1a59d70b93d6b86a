use b3_trade_loader::runner::{
    ConnectionArgs, DEFAULT_CONCURRENCY, DEFAULT_HTTP_PORT, DOWNLOAD_WORKDAYS, DownloadArgs,
    IngestArgs, ServeArgs, download, run_ingest, serve,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version, about = "Load B3 daily trade files into PostgreSQL")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Quiet mode - warnings and the final summary only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(ClapArgs, Clone)]
struct Connection {
    /// Database host
    #[arg(long, env = "DATABASE_HOST", default_value = "localhost")]
    db_host: String,

    /// Database port
    #[arg(long, env = "DATABASE_PORT", default_value_t = 5432)]
    db_port: u16,

    /// Database name
    #[arg(long, env = "DATABASE_NAME")]
    db_name: String,

    /// Database username
    #[arg(long, env = "DATABASE_USERNAME")]
    db_username: String,

    /// Database password
    #[arg(long, env = "DATABASE_PASSWORD", hide_env_values = true)]
    db_password: String,

    /// Require TLS for the database connection
    #[arg(long, env = "DATABASE_SSL")]
    db_ssl: bool,
}

impl From<Connection> for ConnectionArgs {
    fn from(c: Connection) -> Self {
        ConnectionArgs {
            host: c.db_host,
            port: c.db_port,
            database: c.db_name,
            username: c.db_username,
            password: c.db_password,
            ssl: c.db_ssl,
        }
    }
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Ingest every file of a directory into the trade table
    Load {
        /// Directory holding the semicolon-delimited trade files
        #[arg(short, long, env = "CSV_PATH")]
        source_dir: PathBuf,

        /// Number of files processed in parallel
        #[arg(short, long, env = "INGESTION_CORES", default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Fail a file on malformed numeric or date fields instead of storing zeroes
        #[arg(long)]
        strict_fields: bool,

        #[command(flatten)]
        connection: Connection,
    },
    /// Serve quote statistics over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "APP_DEFAULT_PORT", default_value_t = DEFAULT_HTTP_PORT)]
        port: u16,

        #[command(flatten)]
        connection: Connection,
    },
    /// Download the trade files of the most recent workdays
    Download {
        /// Directory the archives are extracted into
        #[arg(short, long, env = "CSV_PATH")]
        dest_dir: PathBuf,

        /// Number of past workdays to fetch
        #[arg(short, long, default_value_t = DOWNLOAD_WORKDAYS)]
        workdays: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.quiet);

    match args.command {
        Command::Load {
            source_dir,
            concurrency,
            strict_fields,
            connection,
        } => {
            let result = run_ingest(IngestArgs {
                connection: connection.into(),
                source_dir,
                concurrency,
                strict_fields,
                quiet: args.quiet,
            })
            .await?;

            println!();
            println!("Ingestion Summary");
            println!("=================");
            println!("Run ID: {}", result.run_id);
            println!("Files: {} of {} loaded", result.files_loaded, result.files_discovered);
            println!("Rows staged: {}", result.rows_staged);
            println!("Rows merged: {}", result.rows_merged);
            println!("Peak concurrent files: {}", result.peak_in_flight);
            println!("Duration: {:.2}s", result.duration.as_secs_f64());
        }
        Command::Serve { port, connection } => {
            serve(ServeArgs {
                connection: connection.into(),
                port,
            })
            .await?;
        }
        Command::Download { dest_dir, workdays } => {
            let summary = download(DownloadArgs { dest_dir, workdays }).await?;
            println!(
                "Downloaded {} of {} days ({} files extracted)",
                summary.days_downloaded, summary.days_requested, summary.files_extracted
            );
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    // RUST_LOG wins over the built-in defaults
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("b3_trade_loader=warn,sqlx=off")
        } else {
            EnvFilter::new("b3_trade_loader=info,sqlx=off")
        }
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION: [&str; 6] = [
        "--db-name",
        "b3",
        "--db-username",
        "postgres",
        "--db-password",
        "postgres",
    ];

    #[test]
    fn test_load_defaults_concurrency() {
        let mut argv = vec!["b3-trade-loader", "load", "--source-dir", "/data/b3"];
        argv.extend(CONNECTION);
        let args = Args::try_parse_from(argv).unwrap();

        match args.command {
            Command::Load { concurrency, strict_fields, .. } => {
                assert_eq!(concurrency, DEFAULT_CONCURRENCY);
                assert!(!strict_fields);
            }
            _ => panic!("expected load"),
        }
    }

    #[test]
    fn test_serve_defaults_port() {
        let mut argv = vec!["b3-trade-loader", "serve"];
        argv.extend(CONNECTION);
        let args = Args::try_parse_from(argv).unwrap();

        assert!(matches!(args.command, Command::Serve { port, .. } if port == DEFAULT_HTTP_PORT));
    }

    #[test]
    fn test_download_defaults_workdays() {
        let args = Args::try_parse_from(["b3-trade-loader", "download", "--dest-dir", "/tmp/b3"]).unwrap();

        assert!(matches!(
            args.command,
            Command::Download { workdays, .. } if workdays == DOWNLOAD_WORKDAYS
        ));
    }
}
