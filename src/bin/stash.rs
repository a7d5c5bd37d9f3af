use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Table;
use stash::{SnapshotFormat, Stash, StashConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "stash", about = "Namespaced Redis toolkit", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "STASH_HOST")]
  host: Option<String>,
  #[arg(short, long, env = "STASH_PORT")]
  port: Option<u16>,
  #[arg(long, env = "STASH_SOCKET")]
  socket: Option<String>,
  #[arg(long, env = "STASH_PASSWORD")]
  password: Option<String>,
  #[arg(long)]
  db: Option<u8>,
  /// Enable payload compression
  #[arg(long)]
  compress: bool,
  #[arg(long)]
  log_level: Option<String>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Print every key under a namespace
  Snapshot {
    namespace: String,
    /// Pretty-printed text instead of compact JSON
    #[arg(long)]
    text: bool,
    /// Skip type classification; non-string keys come back null
    #[arg(long)]
    strings_only: bool,
  },
  /// Read one key
  Get { namespace: String, key: String },
  /// Write one key; JSON values are stored as JSON, anything else as text
  Set {
    namespace: String,
    key: String,
    value: String,
    /// Expiry in seconds
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Stream change events for one or more namespaces
  Watch {
    #[arg(required = true)]
    namespaces: Vec<String>,
  },
  /// Round-trip latency and transform counters
  Stats,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    StashConfig::from_file(path)?
  } else {
    StashConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(host) = args.host {
    config.connection.host = host;
  }
  if let Some(port) = args.port {
    config.connection.port = port;
  }
  if let Some(socket) = args.socket {
    config.connection.socket_path = Some(socket);
  }
  if let Some(password) = args.password {
    config.connection.password = Some(password);
  }
  if let Some(db) = args.db {
    config.connection.database = db;
  }
  if args.compress {
    config.compression.enabled = true;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let stash = Stash::connect(&config).await?;

  match args.command {
    Commands::Snapshot {
      namespace,
      text,
      strings_only,
    } => {
      if strings_only {
        let snapshot = stash.string_snapshot(&namespace).await?;
        print_json(&snapshot, text)?;
      } else if text {
        let clean = stash.clean_snapshot(&namespace, SnapshotFormat::Text).await?;
        if let Some(text) = clean.into_text() {
          println!("{}", text);
        }
      } else {
        let snapshot = stash.snapshot(&namespace).await?;
        print_json(&snapshot, false)?;
      }
    }
    Commands::Get { namespace, key } => match stash.get(&namespace, &key).await? {
      Some(value) => print_json(&value, true)?,
      None => eprintln!("{}", "(nil)".dimmed()),
    },
    Commands::Set {
      namespace,
      key,
      value,
      ttl,
    } => {
      let value = stash::parse_if_json(&value).unwrap_or(serde_json::Value::String(value));
      stash.set(&namespace, &key, &value, ttl).await?;
      println!("{}", "OK".green());
    }
    Commands::Watch { namespaces } => watch(&stash, namespaces).await?,
    Commands::Stats => {
      let latency = stash.ping().await?;
      let stats = stash.performance_stats();

      let mut table = Table::new();
      table.set_header(vec!["Metric", "Value"]);
      table.add_row(vec!["ping".to_string(), format!("{:.2?}", latency)]);
      table.add_row(vec!["cache size".to_string(), stats.cache_size.to_string()]);
      let hit_rate = format!("{:.1}%", stats.hit_rate() * 100.0);
      table.add_row(vec!["cache hit rate".to_string(), hit_rate]);
      table.add_row(vec!["compressions".to_string(), stats.compressions.to_string()]);
      table.add_row(vec!["decompressions".to_string(), stats.decompressions.to_string()]);
      println!("{table}");
    }
  }

  Ok(())
}

async fn watch(stash: &Stash, namespaces: Vec<String>) -> Result<(), anyhow::Error> {
  let mut changes = stash.changes();
  stash.subscribe(&namespaces).await?;
  println!("{} {}", "Watching".yellow(), namespaces.join(", ").cyan());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      received = changes.recv() => match received {
        Ok(event) => println!(
          "{} {}{}{} {}",
          event.received_at.format("%H:%M:%S%.3f").to_string().dimmed(),
          event.namespace.cyan(),
          stash.keys().separator(),
          event.key.bold(),
          event.kind.to_string().green()
        ),
        Err(RecvError::Lagged(skipped)) => {
          eprintln!("{}: {} events dropped", "Lagged".red(), skipped)
        }
        Err(RecvError::Closed) => break,
      },
    }
  }

  stash.shutdown().await;
  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<(), anyhow::Error> {
  let rendered = if pretty {
    serde_json::to_string_pretty(value)?
  } else {
    serde_json::to_string(value)?
  };
  println!("{}", rendered);
  Ok(())
}
