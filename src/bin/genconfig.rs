use clap::Parser;
use fronted::discovery::{Discovery, TlsProber};
use fronted::{load_domains, DiscoveryConfig, DomainSet};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Probe candidate front domains and write the masquerade model.
#[derive(Parser, Debug)]
#[command(name = "genconfig")]
#[command(version, about)]
struct Args {
  /// File with one candidate domain per line
  #[arg(long)]
  domains: Option<PathBuf>,

  /// File with domains to skip, one per line
  #[arg(long)]
  blacklist: Option<PathBuf>,

  /// Directory of proxied-site lists to merge into the model
  #[arg(long = "proxiedsites")]
  proxied_sites: Option<PathBuf>,

  /// Minimum frequency (percentage) for trusting a root CA
  #[arg(long = "minfreq", default_value_t = 3.0)]
  min_frequency: f64,

  /// Concurrent probe workers
  #[arg(long, default_value_t = 50)]
  workers: usize,

  /// Per-domain probe timeout in seconds
  #[arg(long, default_value_t = 10)]
  timeout: u64,

  /// Where to write the model
  #[arg(short, long, default_value = "masquerades.json")]
  output: PathBuf,
}

fn exit_with(code: i32, message: &str) -> ! {
  tracing::error!("{}", message);
  process::exit(code);
}

#[tokio::main]
async fn main() {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .init();

  // help and usage errors exit 1, like every other fatal error
  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(e) => {
      let _ = e.print();
      process::exit(1);
    }
  };

  let Some(domains_path) = args.domains else {
    exit_with(2, "please specify a domains file");
  };
  let Some(proxied_sites_dir) = args.proxied_sites else {
    exit_with(3, "please specify a proxied site directory");
  };
  let Some(blacklist_path) = args.blacklist else {
    exit_with(3, "please specify a blacklist file");
  };

  let domains = match load_domains(&domains_path).await {
    Ok(domains) => domains,
    Err(e) => exit_with(1, &format!("unable to read domains file: {}", e)),
  };
  // an unopenable directory is logged inside and yields an empty set
  let proxied_sites = match DomainSet::load_proxied_sites(&proxied_sites_dir).await {
    Ok(sites) => sites,
    Err(e) => exit_with(1, &format!("unable to read proxied sites: {}", e)),
  };
  let blacklist = match DomainSet::load_blacklist(&blacklist_path).await {
    Ok(blacklist) => blacklist,
    Err(e) => exit_with(1, &format!("unable to read blacklist file: {}", e)),
  };

  let config = DiscoveryConfig {
    workers: args.workers,
    probe_timeout_secs: args.timeout,
    min_frequency: args.min_frequency,
    ..DiscoveryConfig::default()
  };
  let prober = match TlsProber::native(config.port, config.probe_timeout()) {
    Ok(prober) => prober,
    Err(e) => exit_with(1, &format!("unable to load system roots: {}", e)),
  };
  let model = Discovery::new(prober, blacklist, config)
    .discover(domains, proxied_sites)
    .await;
  tracing::info!(
    "{} trusted CAs, {} masquerades",
    model.cas().len(),
    model.masquerades().len()
  );
  if let Err(e) = model.save(&args.output).await {
    exit_with(1, &format!("unable to write {}: {}", args.output.display(), e));
  }
  tracing::info!("wrote {}", args.output.display());
}
