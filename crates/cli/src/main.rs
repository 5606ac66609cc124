use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use herald_controller::{Controller, ControllerConfig, LogNotifier, MessageSync};
use herald_core::{Message, Object, ResourceStore, Selector};
use herald_kubehub::{KubeStore, DEFAULT_GVK};
use herald_store::{EventHandler, Informer, InformerConfig, LocalCache, MemoryStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "heraldctl", version, about = "Herald Message controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label filter, repeatable: -l team=ops
    #[arg(short = 'l', long = "selector", global = true)]
    labels: Vec<String>,

    /// Resource key, e.g. "herald.dev/v1alpha1/Message"
    #[arg(long = "gvk", global = true, env = "HERALD_GVK", default_value = DEFAULT_GVK)]
    gvk: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the cluster until Ctrl-C
    Run {
        /// Concurrent workers (overrides HERALD_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Give up on a key after this many failures (overrides HERALD_MAX_RETRIES)
        #[arg(long = "max-retries")]
        max_retries: Option<u32>,
        /// Periodic resync in seconds, 0 disables (overrides HERALD_RESYNC_SECS)
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
    },
    /// Run the controller against seeded in-memory Messages and exit once all are sent
    Demo {
        /// Number of Messages to seed
        #[arg(long, default_value_t = 3)]
        count: usize,
        /// Status writes to reject with a conflict, to exercise retries
        #[arg(long, default_value_t = 0)]
        conflicts: usize,
        /// Retry backoff base in milliseconds
        #[arg(long = "backoff-ms", default_value_t = 100)]
        backoff_ms: u64,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List Messages
    Ls,
    /// Watch Messages and print +/~/- events
    Watch,
}

fn init_tracing() {
    let env = std::env::var("HERALD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HERALD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HERALD_METRICS_ADDR; expected host:port");
        }
    }
}

fn selector(namespace: Option<&str>, labels: &[String]) -> Result<Selector> {
    let mut sel = match namespace {
        Some(ns) => Selector::namespaced(ns),
        None => Selector::all(),
    };
    for pair in labels {
        let (k, v) = pair.split_once('=').ok_or_else(|| anyhow!("invalid label selector {:?} (expect key=value)", pair))?;
        sel = sel.with_label(k.trim(), v.trim());
    }
    Ok(sel)
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Ctrl-C received; shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutting down"),
        },
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

async fn cancel_when_all_sent(cache: Arc<LocalCache<Message>>, cancel: CancellationToken) {
    let mut epochs = cache.subscribe_epoch();
    loop {
        if cache.list().iter().all(|m| m.status.sent) {
            info!(messages = cache.len(), "all messages sent");
            cancel.cancel();
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = epochs.changed() => if changed.is_err() { return; },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let sel = selector(cli.namespace.as_deref(), &cli.labels)?;

    match cli.command {
        Commands::Run { workers, max_retries, resync_secs } => {
            let mut cfg = ControllerConfig::from_env();
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            if max_retries.is_some() {
                cfg.max_retries = max_retries;
            }
            if let Some(secs) = resync_secs {
                cfg.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
            }
            cfg.selector = sel;
            info!(gvk = %cli.gvk, workers = cfg.workers, max_retries = ?cfg.max_retries, "run invoked");

            let store: Arc<dyn ResourceStore<Message>> = Arc::new(KubeStore::<Message>::connect(&cli.gvk).await?);
            let sync = Arc::new(MessageSync::new(Arc::clone(&store), Arc::new(LogNotifier)));
            let cancel = CancellationToken::new();
            let mut controller = Controller::new(store, sync, cfg, cancel.clone());
            controller.start().await.context("starting controller")?;
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
            controller.run().await?;
        }
        Commands::Demo { count, conflicts, backoff_ms, workers } => {
            let store = Arc::new(MemoryStore::<Message>::new());
            for i in 0..count {
                let mut msg = Message::new("default", format!("msg-{}", i), format!("Greeting {}", i), "hello from herald");
                msg.metadata.labels.insert("app".into(), "herald-demo".into());
                store.create(msg)?;
            }
            store.fail_status_updates(conflicts);

            let mut cfg = ControllerConfig::from_env();
            cfg.backoff_base = Duration::from_millis(backoff_ms.max(1));
            cfg.backoff_max = cfg.backoff_max.max(cfg.backoff_base);
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            cfg.selector = sel;
            info!(count, conflicts, workers = cfg.workers, "demo invoked");

            let sync = Arc::new(MessageSync::new(store.clone(), Arc::new(LogNotifier)));
            let cancel = CancellationToken::new();
            let mut controller = Controller::new(store.clone(), sync, cfg, cancel.clone());
            controller.start().await.context("starting controller")?;
            tokio::spawn(cancel_when_all_sent(controller.cache(), cancel.clone()));
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
            controller.run().await?;

            let list = store.list(&Selector::all()).await?;
            match cli.output {
                Output::Human => {
                    print_table(&list.items);
                    println!("status writes: {}  total writes: {}", store.status_writes(), store.writes());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list.items)?),
            }
        }
        Commands::Ls => {
            info!(gvk = %cli.gvk, ns = ?cli.namespace, "ls invoked");
            let store = KubeStore::<Message>::connect(&cli.gvk).await?;
            let list = store.list(&sel).await?;
            match cli.output {
                Output::Human => print_table(&list.items),
                Output::Json => println!("{}", serde_json::to_string_pretty(&list.items)?),
            }
        }
        Commands::Watch => {
            info!(gvk = %cli.gvk, ns = ?cli.namespace, "watch invoked");
            let store: Arc<dyn ResourceStore<Message>> = Arc::new(KubeStore::<Message>::connect(&cli.gvk).await?);
            let config = InformerConfig { resync_period: None, ..InformerConfig::default() };
            let mut informer = Informer::new(store, sel, config);
            informer.add_handler(Arc::new(Printer { output: cli.output }));
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
            informer.run(cancel).await;
            warn!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

fn print_table(items: &[Message]) {
    println!("{:<11} {:<20} {:<6} {:<7} HEADER", "NAMESPACE", "NAME", "SENT", "AGE");
    for m in items {
        let ns = if m.metadata.namespace.is_empty() { "-" } else { m.metadata.namespace.as_str() };
        let age = render_age(m.metadata.creation_timestamp.as_deref());
        println!("{:<11} {:<20} {:<6} {:<7} {}", ns, m.metadata.name, m.status.sent, age, m.spec.header);
    }
}

fn render_age(creation_ts: Option<&str>) -> String {
    let Some(ts) = creation_ts.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

/// Prints one line per cache transition.
struct Printer {
    output: Output,
}

impl Printer {
    fn emit(&self, sign: &str, event: &str, obj: &Message) {
        let key = obj.key().map(|k| k.to_string()).unwrap_or_else(|_| "<unnamed>".to_string());
        match self.output {
            Output::Human => println!("{} {}", sign, key),
            Output::Json => {
                let line = serde_json::json!({ "event": event, "key": key, "object": obj });
                println!("{}", line);
            }
        }
    }
}

impl EventHandler<Message> for Printer {
    fn on_add(&self, obj: &Arc<Message>) {
        self.emit("+", "added", obj);
    }

    fn on_update(&self, old: &Arc<Message>, new: &Arc<Message>) {
        if old != new {
            self.emit("~", "modified", new);
        }
    }

    fn on_delete(&self, obj: &Arc<Message>) {
        self.emit("-", "deleted", obj);
    }
}
