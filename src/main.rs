use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use storefront_kv::breaker::{CircuitBreaker, SqliteStateStore};
use storefront_kv::config::Config;
use storefront_kv::db::Database;
use storefront_kv::{logging, RemoteStore, ResilientStore, SqliteStore, TracingObserver};

#[derive(Parser, Debug)]
#[command(name = "sfkv")]
#[command(about = "Inspect and edit the storefront's persisted key-value data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-kv/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the value stored under a key
  Get { key: String },
  /// Store a JSON value under a key
  Set {
    key: String,
    /// JSON text, e.g. '{"balance": 42}'
    value: String,
  },
  /// Delete a key
  Remove { key: String },
  /// List keys held in the local store
  Keys,
  /// Circuit breaker state
  Breaker {
    #[command(subcommand)]
    action: BreakerAction,
  },
}

#[derive(Subcommand, Debug)]
enum BreakerAction {
  /// Show the persisted breaker state
  Status,
  /// Force the breaker closed
  Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let db = match &config.local.path {
    Some(path) => Database::open_at(path)?,
    None => Database::open()?,
  };
  let db = Arc::new(db);

  let breaker = Arc::new(CircuitBreaker::new(
    config.breaker,
    Arc::new(SqliteStateStore::new(db.clone())),
  ));
  let remote = RemoteStore::from_config(&config)?;
  let store = ResilientStore::new(remote, SqliteStore::new(db), breaker)
    .with_observer(TracingObserver);

  match args.command {
    Command::Get { key } => {
      let (value, outcome) = store.get_item_with_outcome(&key).await?;
      info!(key = %key, %outcome, "get");
      let value = value.unwrap_or(Value::Null);
      println!("{}", to_pretty(&value)?);
    }
    Command::Set { key, value } => {
      let value: Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
      let outcome = store.set_item_with_outcome(&key, &value).await?;
      info!(key = %key, %outcome, "set");
    }
    Command::Remove { key } => {
      let outcome = store.remove_item_with_outcome(&key).await?;
      info!(key = %key, %outcome, "remove");
    }
    Command::Keys => {
      for key in store.local().keys()? {
        println!("{}", key);
      }
    }
    Command::Breaker { action } => match action {
      BreakerAction::Status => {
        let breaker = store.breaker();
        let mut status = serde_json::to_value(breaker.state())
          .map_err(|e| eyre!("Failed to serialize breaker state: {}", e))?;
        status["canTryRemote"] = Value::Bool(breaker.can_try_remote());
        status["maxFailures"] = breaker.config().max_failures.into();
        status["resetTimeoutMs"] = breaker.config().reset_timeout_ms.into();
        println!("{}", to_pretty(&status)?);
      }
      BreakerAction::Reset => {
        store.breaker().reset();
        println!("circuit breaker closed");
      }
    },
  }

  Ok(())
}

fn to_pretty(value: &Value) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format JSON: {}", e))
}
