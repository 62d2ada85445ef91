use {
    clap::{Parser, Subcommand},
    log::{LevelFilter, debug},
    rfm::{ClientConfig, DEFAULT_PORT, RemoteFileManager, utils},
    std::{
        io::{Read, Write},
        path::PathBuf,
    },
    tokio::fs,
};

#[derive(Debug, clap::Parser)]
#[command(about = "Talk to a remote file manager server")]
struct Cli {
    /// Server host
    #[arg(long, env = "FILEMGR_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, env = "FILEMGR_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Remote directory to bind; empty means the server's base directory
    #[arg(long, env = "FILEMGR_DIR", default_value = "")]
    dir: String,

    /// Raise log verbosity (-v debug, -vv trace); FILEMGR_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the files of the remote directory
    List,
    /// Print a remote file, or save it with --out
    Read {
        name: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Upload FILE, or stdin, as NAME
    Write { name: String, file: Option<PathBuf> },
}

/// `FILEMGR_LOG` takes a number, a level name or an `env_logger` filter.
fn logger_builder(verbose: u8, env_filter: Option<&str>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(match verbose {
        0 => LevelFilter::Warn,
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

fn init_logger(verbose: u8) {
    let env_filter = std::env::var("FILEMGR_LOG").ok();
    logger_builder(verbose, env_filter.as_deref()).init();
}

async fn run(fm: &mut RemoteFileManager, command: Command) -> rfm::Result<()> {
    match command {
        Command::List => {
            for name in fm.list().await? {
                println!("{}", name);
            }
        }
        Command::Read { name, out } => {
            let data = fm.read(&name).await?;
            match out {
                Some(path) => fs::write(path, &data).await?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Command::Write { name, file } => {
            let data = match file {
                Some(path) => fs::read(path).await?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let count = fm.write(&name, &data).await?;
            println!("{} bytes written", count);
        }
    }
    Ok(())
}

async fn rfmc_main(
    Cli {
        host,
        port,
        dir,
        command,
        ..
    }: Cli,
) -> rfm::Result<i32> {
    let config = ClientConfig::new(host, port);
    let mut fm = RemoteFileManager::connect(&config, &dir).await?;
    debug!("bound handle {} to {:?}", fm.handle(), dir);

    // The handle is released even when the command fails.
    let result = run(&mut fm, command).await;
    let released = fm.destroy().await;
    result.and(released).and(Ok(0))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let exit_code = rfmc_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn numeric_log_levels() {
        assert_eq!(logger_builder(0, None).build().filter(), LevelFilter::Warn);
        assert_eq!(logger_builder(0, Some("1")).build().filter(), LevelFilter::Debug);
        assert_eq!(logger_builder(0, Some("0")).build().filter(), LevelFilter::Info);
    }

    #[test]
    fn subcommands() {
        let cli = Cli::try_parse_from(["rfmc", "--port", "7000", "read", "a.txt", "--out", "/tmp/a"])
            .unwrap();
        assert_eq!(cli.port, 7000);
        match cli.command {
            Command::Read { name, out } => {
                assert_eq!(name, "a.txt");
                assert_eq!(out, Some(PathBuf::from("/tmp/a")));
            }
            c => panic!("unexpected {:?}", c),
        }

        let cli = Cli::try_parse_from(["rfmc", "--dir", "docs", "write", "b.txt"]).unwrap();
        assert_eq!(cli.dir, "docs");
        assert!(matches!(cli.command, Command::Write { file: None, .. }));
    }
}
