//! tekton-runner CLI
//!
//! Renders build documents from a deploy request, submits them to the build
//! cluster, or runs the HTTP service that does both on demand.

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tekton_runner::command::ProcessRunner;
use tekton_runner::config::{self, RegistryTrust, RunnerConfig, DEFAULT_REGISTRY};
use tekton_runner::forward::SocatLauncher;
use tekton_runner::manifest::{self, Manifest, ManifestSynthesizer};
use tekton_runner::server::{self, ServerState};
use tekton_runner::templates::Renderer;
use tekton_runner::{Orchestrator, RunRequest};

/// Build-and-deploy orchestrator for Tekton task runs and kind workspaces
#[derive(Parser)]
#[command(name = "tekton-runner")]
#[command(about = "Build-and-deploy orchestrator for Tekton task runs and kind workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding one kubeconfig per workspace
    #[arg(long, env = "TEKTON_RUNNER_KUBECONFIG_DIR", global = true)]
    kubeconfig_dir: Option<PathBuf>,

    /// Directory holding the external port map and forwarder logs
    #[arg(long, env = "TEKTON_RUNNER_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Node image for new workspace clusters
    #[arg(long, env = "TEKTON_RUNNER_NODE_IMAGE", global = true)]
    node_image: Option<String>,

    /// Registry trusted by workspace nodes (host[:port])
    #[arg(long, env = "TEKTON_RUNNER_REGISTRY_HOST", default_value = DEFAULT_REGISTRY, global = true)]
    registry_host: String,

    /// Address the registry hostname resolves to inside workspace nodes
    #[arg(long, env = "TEKTON_RUNNER_REGISTRY_IP", global = true)]
    registry_ip: Option<String>,

    /// Externally reachable host address used to build endpoints
    #[arg(long, env = "TEKTON_RUNNER_HOST_IP", global = true)]
    host_ip: Option<String>,

    /// Program used to forward external ports
    #[arg(long, env = "TEKTON_RUNNER_FORWARD_BIN", default_value = "socat", global = true)]
    forward_bin: String,

    /// Seconds to wait for a build task to finish
    #[arg(long, env = "TEKTON_RUNNER_BUILD_TIMEOUT_SECS", default_value = "2700", global = true)]
    build_timeout_secs: u64,

    /// Seconds between build status polls
    #[arg(long, env = "TEKTON_RUNNER_POLL_INTERVAL_SECS", default_value = "5", global = true)]
    poll_interval_secs: u64,

    /// Log format (json or text)
    #[arg(long, env = "TEKTON_RUNNER_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a request and print the documents it renders to
    Render {
        /// Request JSON file, or "-" for stdin
        #[arg(long = "in", default_value = "-")]
        input: String,

        /// Also write each document to <dir>/manifest-NN.yaml
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Submit a request to the build cluster and deploy the result
    Apply {
        /// Request JSON file, or "-" for stdin
        #[arg(long = "in", default_value = "-")]
        input: String,

        /// Also write each document to <dir>/manifest-NN.yaml
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Stop after submitting the build task
        #[arg(long)]
        no_deploy: bool,
    },

    /// Run the HTTP service
    Serve {
        /// Listen address; a bare ":port" listens on all interfaces
        #[arg(long, env = "TEKTON_RUNNER_ADDR", default_value = ":8088")]
        addr: String,

        /// Bearer token required by /run
        #[arg(long, env = "TEKTON_RUNNER_API_KEY")]
        api_key: Option<String>,
    },
}

impl Cli {
    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            kubeconfig_dir: self
                .kubeconfig_dir
                .clone()
                .unwrap_or_else(config::default_kubeconfig_dir),
            state_dir: self
                .state_dir
                .clone()
                .unwrap_or_else(config::default_state_dir),
            node_image: self.node_image.clone(),
            registry: RegistryTrust {
                host: self.registry_host.clone(),
                ip: self.registry_ip.clone(),
            },
            host_ip: self.host_ip.clone(),
            forward_bin: self.forward_bin.clone(),
            build_timeout: Duration::from_secs(self.build_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default = if verbose {
        "info,tekton_runner=debug"
    } else {
        "warn,tekton_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

fn read_request(input: &str) -> Result<RunRequest> {
    let data = if input == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        std::fs::read(input).with_context(|| format!("Failed to read {input}"))?
    };
    RunRequest::from_json(&data).context("Failed to parse request")
}

fn write_manifests(dir: &Path, manifests: &[Manifest]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for (i, doc) in manifests.iter().enumerate() {
        let path = dir.join(format!("manifest-{:02}.yaml", i + 1));
        std::fs::write(&path, &doc.body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Accept Go-style `:8088` as shorthand for all interfaces.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn orchestrator(config: RunnerConfig) -> Result<Arc<Orchestrator>> {
    let launcher = SocatLauncher::new(config.forward_bin.clone());
    let orchestrator = Orchestrator::new(config, Arc::new(ProcessRunner), Arc::new(launcher))
        .await
        .context("Failed to initialise orchestrator")?;
    Ok(Arc::new(orchestrator))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);
    let config = cli.runner_config();

    match cli.command {
        Commands::Render { input, out_dir } => {
            let request = read_request(&input)?.validate()?;
            let renderer = Arc::new(Renderer::new()?);
            let manifests = ManifestSynthesizer::new(renderer).synthesize(&request)?;
            if let Some(dir) = &out_dir {
                write_manifests(dir, &manifests)?;
            }
            println!("{}", manifest::join(&manifests));
        }
        Commands::Apply {
            input,
            out_dir,
            no_deploy,
        } => {
            let orchestrator = orchestrator(config).await?;
            let plan = orchestrator.prepare(read_request(&input)?)?;
            if let Some(dir) = &out_dir {
                write_manifests(dir, &plan.manifests)?;
            }

            let submission = orchestrator.submit(&plan).await?;
            for applied in &submission.applied {
                println!("applied {applied}");
            }
            let Some(task_run) = submission.task_run else {
                return Ok(());
            };
            println!("taskrun {task_run}");

            if no_deploy || plan.request.target().is_none() {
                return Ok(());
            }
            info!(task_run = %task_run, "Waiting for build to finish");
            if let Some(app) = orchestrator.complete(&plan.request, &task_run).await? {
                println!("endpoint {}", app.endpoint);
            }
        }
        Commands::Serve { addr, api_key } => {
            let orchestrator = orchestrator(config).await?;
            let state = Arc::new(ServerState::new(orchestrator, api_key));
            server::run_server(state, &listen_addr(&addr)).await?;
        }
    }

    Ok(())
}
