mod catfwd;

use std::process::ExitCode;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "cat-forwarding",
    version,
    about = "Open the purr-tals for cats to connect worldwide!",
    long_about = "Cat Forwarding exposes a port on your local machine to the outside world \
through a relay server. Provide a valid port (1-65535) and every connection the relay \
receives on your public port is forwarded to it."
)]
struct Cli {
    /// Local TCP port to expose (1-65535).
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Path to a config file (.toml/.yaml/.yml) or a directory containing cat-forwarding.*. If omitted, uses CATFWD_CONFIG; then cat-forwarding.* in the CWD; then the user config dir; else built-in defaults.
    #[arg(long, env = "CATFWD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Relay address (host:port); overrides the config file.
    #[arg(long, env = "CATFWD_SERVER")]
    server: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help / --version land here too and are not failures.
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };

    let opts = catfwd::RunOptions {
        port: cli.port,
        config_path: cli.config,
        server_addr: cli.server,
        verbose: cli.verbose,
    };

    match catfwd::run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
