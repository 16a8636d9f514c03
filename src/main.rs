//! nodeconfig - CLI Entry Point
//!
//! Subcommands:
//! - `check`: parse a descriptor list and report every failure
//! - `generate`: build a client document from a descriptor list
//! - `probe`: TCP-probe one endpoint
//! - `render`: render a subscription from a store snapshot by token
//! - `health`: probe every node of a store snapshot and write results back
//! - `stats`: print usage figures of one subscription as JSON

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nodeconfig::descriptor::ParseMode;
use nodeconfig::probe::{self, ProbeSink};
use nodeconfig::service::{InMemoryStore, SubscriptionService};
use nodeconfig::{Config, ConfigDocument, Engine, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "nodeconfig")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Proxy subscription configuration engine")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (overrides config)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse descriptors (one per line, `-` for stdin) and report errors
    Check {
        input: PathBuf,
    },

    /// Build a client document from descriptors
    Generate {
        input: PathBuf,

        /// YAML template whose keys are carried into the document
        #[arg(short = 't', long = "template")]
        template: Option<PathBuf>,

        /// Skip broken descriptors instead of failing
        #[arg(long = "lenient")]
        lenient: bool,

        /// Name proxies `<BASE_NAME>001`, `<BASE_NAME>002`, ... (overrides config)
        #[arg(long = "base-name")]
        base_name: Option<String>,

        /// Append today's date to every proxy name
        #[arg(long = "timestamp")]
        timestamp: bool,

        /// Output file (stdout when omitted)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Probe a single endpoint
    Probe {
        host: String,
        port: u16,

        /// Timeout in milliseconds (overrides config)
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },

    /// Render a subscription from a store snapshot
    Render {
        /// Store snapshot (YAML)
        #[arg(short = 's', long = "store")]
        store: PathBuf,

        /// Subscription token
        #[arg(long = "token")]
        token: String,

        /// Client address recorded as last access
        #[arg(long = "ip", default_value = "127.0.0.1")]
        ip: String,

        /// Output file (stdout when omitted)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Probe every node of a store snapshot
    Health {
        /// Store snapshot (YAML)
        #[arg(short = 's', long = "store")]
        store: PathBuf,

        /// Keep checking every probe interval until interrupted
        #[arg(short = 'w', long = "watch")]
        watch: bool,
    },

    /// Print usage figures of a subscription
    Stats {
        /// Store snapshot (YAML)
        #[arg(short = 's', long = "store")]
        store: PathBuf,

        /// Subscription id
        id: String,
    },
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("nodeconfig-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_async(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    init_logging(&args, &config)?;
    info!("nodeconfig v{}", VERSION);

    match args.command {
        Command::Check { input } => check(&config, &input).await,
        Command::Generate {
            input,
            template,
            lenient,
            base_name,
            timestamp,
            output,
        } => {
            let mut naming = config.document.naming.clone();
            if let Some(base) = base_name {
                naming.sequential = true;
                naming.base_name = Some(base);
            }
            naming.add_timestamp |= timestamp;
            naming.validate()?;
            let engine = Engine::new(
                config.parser(),
                config.synthesizer().with_naming(naming),
                if lenient { ParseMode::Lenient } else { config.parser.mode },
            );
            generate(&engine, &input, template.as_deref(), output.as_deref()).await
        }
        Command::Probe {
            host,
            port,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.probe.timeout());
            probe_one(&host, port, timeout).await
        }
        Command::Render {
            store,
            token,
            ip,
            output,
        } => render(&config, &store, &token, &ip, output.as_deref()).await,
        Command::Health { store, watch } => health(&config, &store, watch).await,
        Command::Stats { store, id } => stats(&config, &store, &id).await,
    }
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let level = args
        .log_level
        .as_deref()
        .or(config.log_level.as_deref())
        .unwrap_or("info");

    tracing_subscriber::registry()
        .with(
            args.log_json
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!args.log_json)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("nodeconfig={}", level).parse()?),
        )
        .init();
    Ok(())
}

/// Read descriptor lines; `#` comments become blank so line numbers hold.
async fn read_descriptors(input: &Path) -> anyhow::Result<Vec<String>> {
    let content = if input == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?
    };

    Ok(content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with('#') {
                String::new()
            } else {
                line.to_string()
            }
        })
        .collect())
}

async fn write_output(doc: &ConfigDocument, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            doc.write_to_file(path).await?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", doc.to_yaml()?),
    }
    Ok(())
}

async fn check(config: &Config, input: &Path) -> anyhow::Result<()> {
    let lines = read_descriptors(input).await?;
    let batch = config.parser().parse_batch(&lines, ParseMode::Lenient)?;

    for d in &batch.descriptors {
        println!("ok    {}  {} {}:{}", d.name(), d.kind(), d.server(), d.port());
    }
    for e in &batch.errors {
        println!("error line {}: {}", e.index + 1, e.error);
    }

    if !batch.is_clean() {
        bail!(
            "{} of {} descriptors failed to parse",
            batch.errors.len(),
            batch.errors.len() + batch.descriptors.len()
        );
    }
    Ok(())
}

async fn generate(
    engine: &Engine,
    input: &Path,
    template: Option<&Path>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let lines = read_descriptors(input).await?;

    let doc = match template {
        Some(path) => {
            let template = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let batch = engine.parser().parse_batch(&lines, engine.mode())?;
            engine
                .synthesizer()
                .install_yaml(&template, &batch.descriptors)?
        }
        None => engine.render(&lines)?,
    };

    write_output(&doc, output).await
}

async fn probe_one(host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
    match probe::probe(host, port, timeout).await {
        Ok(ms) => {
            println!("{}:{} reachable in {}ms", host, port, ms);
            Ok(())
        }
        Err(e) => bail!("{}:{} unreachable ({:?}): {}", host, port, e.kind(), e),
    }
}

async fn render(
    config: &Config,
    store_path: &Path,
    token: &str,
    ip: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let token = Uuid::parse_str(token).context("token is not a UUID")?;
    let store = Arc::new(InMemoryStore::load(store_path).await?);
    let service = SubscriptionService::new(store.clone(), config.parser(), config.synthesizer());

    let doc = service.retrieve(token, ip, Utc::now()).await;
    // Lifecycle changes are persisted even when rendering is refused.
    store.save(store_path).await?;

    write_output(&doc?, output).await
}

async fn health(config: &Config, store_path: &Path, watch: bool) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::load(store_path).await?);
    let checker = Arc::new(config.health_checker());

    if watch {
        if !checker.is_auto() {
            bail!("probe interval-secs is 0, nothing to watch");
        }
        let handle = {
            let checker = checker.clone();
            let store = store.clone();
            tokio::spawn(async move { checker.start(store.clone(), store).await })
        };

        tokio::signal::ctrl_c().await?;
        info!("Stopping health checks");
        checker.close();
        if let Err(e) = handle.await {
            warn!("Health check loop ended abnormally: {}", e);
        }
    } else {
        let sink: Arc<dyn ProbeSink> = store.clone();
        let ticket = checker.check_batch(store.all_nodes(), sink);
        ticket.wait().await;

        for node in store.all_nodes() {
            match node.latency_ms {
                Some(ms) => println!("{:<8} {}  {}ms", node.status, node.name, ms),
                None => println!(
                    "{:<8} {}  {}",
                    node.status,
                    node.name,
                    node.last_error.as_deref().unwrap_or("-")
                ),
            }
        }
    }

    store.save(store_path).await?;
    Ok(())
}

async fn stats(config: &Config, store_path: &Path, id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(id).context("subscription id is not a UUID")?;
    let store = Arc::new(InMemoryStore::load(store_path).await?);
    let service = SubscriptionService::new(store, config.parser(), config.synthesizer());

    println!("{}", service.stats(id).await?.to_json()?);
    Ok(())
}
