use {
    clap::Parser,
    env_logger::Target,
    log::{LevelFilter, info, warn},
    rfm::{io_err, res, srv::srv_async, utils, *},
    std::{
        fs::OpenOptions,
        io::{self, Write},
        path::{Path, PathBuf},
        time::Duration,
    },
    tokio::fs,
};

#[derive(Debug, clap::Parser)]
#[command(about = "Serve local directories to remote file manager clients")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FILEMGR_HOST", default_value = "0.0.0.0")]
    host: String,

    /// TCP port to listen on
    #[arg(long, env = "FILEMGR_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base directory for CREATE requests with an empty or relative path
    #[arg(long, env = "FILEMGR_DIR", default_value = DEFAULT_DIR)]
    dir: PathBuf,

    /// Close connections idle for this many seconds
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Release the handles a client created when its connection closes
    #[arg(long)]
    reap_on_disconnect: bool,

    /// Raise log verbosity (-v debug, -vv trace); FILEMGR_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also append log lines to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// Writes everything to both sinks.
struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// `FILEMGR_LOG` takes a number, a level name or an `env_logger` filter.
fn logger_builder(verbose: u8, env_filter: Option<&str>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    if let Some(value) = env_filter {
        match utils::parse_log_level(value) {
            Some(level) => builder.filter_level(level),
            None => builder.parse_filters(value),
        };
    }
    builder
}

fn init_logger(verbose: u8, log_file: Option<&Path>) {
    let env_filter = std::env::var("FILEMGR_LOG").ok();
    let mut builder = logger_builder(verbose, env_filter.as_deref());

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(Tee {
                    first: io::stderr(),
                    second: file,
                })));
            }
            // Keep serving with stderr only.
            Err(e) => eprintln!("cannot open log file {}: {}", path.display(), e),
        }
    }
    builder.init();
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

async fn rfmd_main(
    Cli {
        host,
        port,
        dir,
        idle_timeout,
        reap_on_disconnect,
        ..
    }: Cli,
) -> rfm::Result<i32> {
    if !fs::try_exists(&dir).await? {
        fs::create_dir_all(&dir).await?;
    }
    if !fs::metadata(&dir).await?.is_dir() {
        return res!(io_err!(Other, "base directory must be a directory"));
    }

    let config = ServerConfig::new(host, port, dir)
        .with_idle_timeout(idle_timeout.map(Duration::from_secs))
        .with_reap_on_disconnect(reap_on_disconnect);

    info!("Ready to accept clients: {}", config.addr());
    srv_async(config, shutdown_signal()).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.log_file.as_deref());

    let exit_code = rfmd_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
