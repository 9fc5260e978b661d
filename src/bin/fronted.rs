use clap::Parser;
use fronted::{ClientConfig, MasqueradeModel, ProxyClient};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Local intercepting proxy that fronts traffic through trusted masquerades.
#[derive(Parser, Debug)]
#[command(name = "fronted")]
#[command(version, about)]
struct Args {
  /// JSON client configuration; defaults apply to missing fields
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Masquerade model written by genconfig
  #[arg(short, long)]
  model: Option<PathBuf>,

  /// Address to listen on, overriding the config
  #[arg(long)]
  addr: Option<String>,

  /// Front requests to loopback hosts too
  #[arg(long)]
  proxy_loopback: bool,

  /// Log request and response headers
  #[arg(long)]
  dump_headers: bool,
}

async fn run(args: Args) -> fronted::Result<()> {
  let mut config = match &args.config {
    Some(path) => ClientConfig::load(path).await?,
    None => ClientConfig::default(),
  };
  if let Some(path) = &args.model {
    config = config.with_model(&MasqueradeModel::load(path).await?);
  }
  if let Some(addr) = args.addr {
    config.listen_addr = addr;
  }
  config.should_proxy_loopback |= args.proxy_loopback;
  config.should_dump_headers |= args.dump_headers;

  ProxyClient::builder(config).build().await?.run().await
}

#[tokio::main]
async fn main() {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .init();

  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(e) => {
      let _ = e.print();
      process::exit(1);
    }
  };
  if let Err(e) = run(args).await {
    tracing::error!("{}", e);
    process::exit(1);
  }
}
