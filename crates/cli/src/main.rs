mod bootstrap;
mod client;
mod deploy;
mod logging;
mod mosh;
mod ssh;
mod sysctl;

use clap::{Parser, Subcommand};

use common::{Error, Result};
use forward::BindPolicy;
use protocol::PROTOCOL_VERSION;

/// Transport selection for the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportMode {
    /// Try the secondary (QUIC) transport, keep the primary on failure.
    Fallback,
    /// Never attempt the secondary transport.
    PrimaryOnly,
    /// Require the secondary transport; fail if it cannot be established.
    SecondaryOnly,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fallback => write!(f, "fallback"),
            Self::PrimaryOnly => write!(f, "primary-only"),
            Self::SecondaryOnly => write!(f, "secondary-only"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "mpf",
    version = PROTOCOL_VERSION,
    about = "mpf (mosh port forward) - dynamic TCP forwarding for roaming shells",
    args_conflicts_with_subcommands = true
)]
struct Args {
    #[command(subcommand)]
    command: Option<Cmd>,

    /// Remote target: [user@]host[:port]. Remaining arguments go to mosh.
    target: Option<String>,

    /// Arguments passed through to mosh.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    mosh_args: Vec<String>,

    /// Ask the local agent for a forward: <slave_port>[:<master_port>].
    /// Only meaningful on the remote host, where the agent runs.
    #[arg(short = 'L', long = "forward", value_name = "SPEC")]
    forwards: Vec<String>,

    /// Transport selection for the tunnel.
    #[arg(long, value_enum, default_value_t = TransportMode::Fallback)]
    transport: TransportMode,

    /// Path of the mpf binary on the remote host.
    #[arg(long, default_value = deploy::DEFAULT_REMOTE_PATH)]
    remote_path: String,

    /// Bind dynamic forwards on 0.0.0.0 instead of 127.0.0.1.
    #[arg(long, default_value_t = false)]
    bind_any: bool,

    /// Mirror newly listening remote ports automatically.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    auto_forward: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run as the slave agent (internal; the master starts this remotely).
    Agent,
    /// Print the version and exit.
    Version,
    /// Ask the local agent for a forward: <slave_port>[:<master_port>].
    Forward { spec: String },
    /// List active forwards.
    List,
    /// Close a forward by its master port.
    Close { port: u16 },
    /// Show the number of live tunnel sessions.
    Sessions,
    /// Stop the local agent.
    Stop,
}

#[tokio::main]
async fn main() {
    // rustls needs a process-wide crypto provider before any TLS config is
    // built (both the agent's listener and the master's dialer).
    rustls::crypto::ring::default_provider().install_default().ok();

    let args = Args::parse();

    if matches!(args.command, Some(Cmd::Version)) {
        println!("{PROTOCOL_VERSION}");
        return;
    }

    let _log_guard = logging::init(matches!(args.command, Some(Cmd::Agent)));

    let result = run(args).await;
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Some(Cmd::Agent) => agent::run().await,
        Some(Cmd::Version) => Ok(()),
        Some(Cmd::Forward { spec }) => client::request(&format!("FORWARD:{spec}")).await,
        Some(Cmd::List) => client::request("LIST").await,
        Some(Cmd::Close { port }) => client::request(&format!("CLOSE:{port}")).await,
        Some(Cmd::Sessions) => client::request("SESSIONS").await,
        Some(Cmd::Stop) => client::request("STOP").await,
        None => match args.target {
            Some(ref target) => {
                let options = bootstrap::Options {
                    target: target.clone(),
                    mosh_args: args.mosh_args.clone(),
                    remote_path: args.remote_path.clone(),
                    transport: args.transport,
                    bind_policy: if args.bind_any {
                        BindPolicy::Any
                    } else {
                        BindPolicy::Loopback
                    },
                    auto_forward: args.auto_forward,
                };
                bootstrap::run(options).await
            }
            None if !args.forwards.is_empty() => {
                for spec in &args.forwards {
                    client::request(&format!("FORWARD:{spec}")).await?;
                }
                Ok(())
            }
            None => Err(Error::Protocol(
                "usage: mpf [user@]host [mosh args...] (see mpf --help)".into(),
            )),
        },
    }
}
