//! Replica node executable.

use std::fs;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use vrmeta::{
    MetaError, NodeId, NullMetaDataSync, VrConfig, VrReplica,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Node ID of myself in the replica-set configuration.
    #[arg(short, long)]
    node_id: NodeId,

    /// Path to the replica-set configuration file (token format).
    #[arg(short, long)]
    config: String,

    /// Optional TOML string of replica runtime parameters.
    #[arg(long)]
    params: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return the parsed replica-set
    /// configuration on success.
    fn sanitize(&self) -> Result<VrConfig, MetaError> {
        if self.node_id < 0 {
            return Err(MetaError(format!(
                "invalid node ID {} given",
                self.node_id
            )));
        }
        if self.threads < 2 {
            return Err(MetaError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let text = fs::read_to_string(&self.config)?;
        let config: VrConfig = text.trim().parse()?;
        config.validate()?;
        if !config.has_node(self.node_id) {
            return Err(MetaError(format!(
                "node ID {} not in configuration '{}'",
                self.node_id, self.config
            )));
        }
        Ok(config)
    }
}

// Replica node executable main entrance.
fn server_main() -> Result<(), MetaError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let vr_config = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-replica")
        .build()?;

    // enter tokio runtime, setup the replica, and start the main event loop
    runtime.block_on(async move {
        let mut replica = VrReplica::new_and_setup(
            args.node_id,
            vr_config,
            Box::new(NullMetaDataSync),
            args.params.as_deref(),
        )
        .await?;

        // termination channel fed by the ctrl-c signal
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx_term.send(true);
            }
        });

        replica.run(rx_term).await?;
        Ok::<(), MetaError>(())
    })?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .init();

    if let Err(e) = server_main() {
        log::error!("replica node exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
