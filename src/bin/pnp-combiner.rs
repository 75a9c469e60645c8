use std::sync::Arc;

use clap::Parser;
use eyre::Context;
use pnp_combiner::metrics::{describe_metrics, RecorderSink};
use pnp_combiner::{Account, AuthSigner, CombinerConfig, Identifier, PrivacyService};

/// Hashes one identifier through the configured signers.
#[derive(Parser, Debug)]
struct Args {
    #[clap(flatten)]
    config: CombinerConfig,

    /// The identifier to hash, an E.164 phone number unless a prefix is given
    #[clap(long)]
    identifier: String,

    /// Identifier prefix for identifiers that are not phone numbers, e.g. `mailto://`
    #[clap(long)]
    identifier_prefix: Option<String>,

    /// The account the request is charged to
    #[clap(long, env = "PNP_COMBINER_ACCOUNT")]
    account: String,

    /// Hex of the account's secp256k1 data encryption key, requests are unsigned without it
    #[clap(long, env = "PNP_COMBINER_ACCOUNT_KEY", hide_env_values = true)]
    account_key: Option<String>,
}

fn install_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{
        fmt::{self},
        EnvFilter,
    };

    let fmt_layer = fmt::layer().with_target(false).with_line_number(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("valid default filter");

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_tracing();
    describe_metrics();
    let args = Args::parse();

    let identifier = match &args.identifier_prefix {
        Some(prefix) => Identifier::other(prefix, &args.identifier),
        None => Identifier::phone_number(&args.identifier),
    }
    .context("while parsing identifier")?;
    let account = Account::parse(&args.account).context("while parsing account")?;
    let auth = match &args.account_key {
        Some(key) => {
            let bytes = hex::decode(key.trim_start_matches("0x")).context("account key is not hex")?;
            AuthSigner::encryption_key(&bytes).context("while loading account key")?
        }
        None => AuthSigner::None,
    };

    let service = PrivacyService::from_config(&args.config, Arc::new(RecorderSink))
        .context("while building combiner")?;
    let result = service
        .hash_identifier(&identifier, &account, Arc::new(auth))
        .await;
    let summary = service.shutdown().await;
    tracing::debug!(?summary, "monitor stopped");

    let hash = result.context("while hashing identifier")?;
    println!("pepper: {}", hash.pepper);
    println!("obfuscated identifier: {}", hash.obfuscated_identifier);
    Ok(())
}
