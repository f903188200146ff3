//! Main entrypoint: the sync engine server and its operator CLI.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use account_registry::{AccountPatch, Registry};
use config_core::EngineConfig;
use kv_store::Store;
use secret_store::SecretVault;
use settings_store::Settings;
use supervisor::{Metrics, Supervisor, WorkerContext, WorkerSpec};

/// `User-Agent` sent on webhook deliveries.
const USER_AGENT: &str = concat!(
    "mailsync/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/mailsync/mailsync)"
);

/// Key of the persisted token records hash.
const TOKENS_KEY: &str = "tokens";

/// Settings entry holding the admin password hash.
const ADMIN_PASSWORD_KEY: &str = "adminPassword";

/// Idle poll interval of queue consumers.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delayed-to-pending promoter period.
const PROMOTER_INTERVAL: Duration = Duration::from_secs(1);

/// Webhook delivery timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth2 access-token expiry tolerance.
const OAUTH2_EXPIRY_TOLERANCE: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "mailsync", version, about = "Multi-tenant email sync engine")]
struct Cli {
    /// Subcommand; none starts the server.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Re-encrypt stored credentials with a new encryption secret.
    Encrypt {
        /// The new encryption secret.
        #[arg(long)]
        secret: String,
    },

    /// Iterate persisted state for diagnostics.
    Scan,

    /// Set the admin password.
    Password {
        /// The password; generated when omitted.
        #[arg(long)]
        password: Option<String>,

        /// Print the base64url fingerprint of the stored hash.
        #[arg(long)]
        hash: bool,
    },

    /// Manage API tokens.
    Tokens {
        #[command(subcommand)]
        command: TokensCommand,
    },

    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
enum TokensCommand {
    /// Issue a new token.
    Issue {
        /// Scopes; any of `*`, `api`, `metrics`. Repeatable.
        #[arg(long = "scope", default_value = "*")]
        scopes: Vec<String>,

        /// Free-form description.
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Export a token record as base64url MessagePack.
    Export {
        /// Token id.
        id: String,
    },

    /// Import a previously exported token record.
    Import {
        /// The exported data.
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command {
        None => serve(config).await,
        Some(Command::Encrypt { secret }) => encrypt(config, &secret).await,
        Some(Command::Scan) => scan(config).await,
        Some(Command::Password { password, hash }) => password_cmd(config, password, hash).await,
        Some(Command::Tokens { command }) => tokens(config, command).await,
        Some(Command::Version) => {
            println!("mailsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Open the store configured in the environment.
async fn open_store(config: &EngineConfig) -> Result<Store> {
    Ok(Store::open(kv_store::Params {
        prefix: config.kv_prefix.clone(),
        snapshot_path: config.state_path.clone(),
    })
    .await?)
}

/// Start the engine and run until SIGTERM/SIGINT.
async fn serve(config: EngineConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let vault = SecretVault::new(config.encryption_secret.as_deref());
    let registry = Registry::new(store.clone(), vault);
    let settings = Settings::new(store.clone());

    if let Some(secret) = &config.service_secret {
        settings.set("serviceSecret", secret).await?;
    } else {
        settings.service_secret().await?;
    }
    let queue_keep = settings.queue_keep().await?;
    let max_log_lines = Arc::new(AtomicUsize::new(settings.max_log_lines().await?));

    let queue_params = queue_engine::Params {
        lease: config.queue_lease,
        queue_keep,
    };
    let notify_queue = queue_engine::QueueEngine::new(
        store.clone(),
        queue_engine::QueueName::Notify,
        queue_params.clone(),
    );
    let submit_queue = queue_engine::QueueEngine::new(
        store.clone(),
        queue_engine::QueueName::Submit,
        queue_params,
    );

    let refresher = match oauth2_providers()? {
        Some(providers) => Some(Arc::new(oauth2_refresh::Refresher::new(
            providers,
            OAUTH2_EXPIRY_TOLERANCE,
        )?)),
        None => None,
    };

    let imap_params = imap_worker::Params {
        store: store.clone(),
        registry: registry.clone(),
        notify_queue: notify_queue.clone(),
        submit_queue: submit_queue.clone(),
        connector: Arc::new(imap_driver::ImapDriver::default()),
        refresher,
        max_log_lines,
    };
    let submit_params = submit_worker::Params {
        store: store.clone(),
        submit_queue: submit_queue.clone(),
        notify_queue: notify_queue.clone(),
        poll_interval: CONSUMER_POLL_INTERVAL,
        promoter_interval: PROMOTER_INTERVAL,
    };
    let notify_params = notify_worker::Params {
        notify_queue: notify_queue.clone(),
        settings: settings.clone(),
        user_agent: USER_AGENT.to_string(),
        http: reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?,
        poll_interval: CONSUMER_POLL_INTERVAL,
        promoter_interval: PROMOTER_INTERVAL,
    };

    let workers = vec![
        WorkerSpec {
            kind: "imap".to_string(),
            count: config.imap_workers,
            assignable: true,
            factory: Arc::new(move |ctx: WorkerContext| {
                let params = imap_params.clone();
                Box::pin(imap_worker::run(ctx, params))
            }),
        },
        WorkerSpec {
            kind: "submit".to_string(),
            count: config.submit_workers,
            assignable: false,
            factory: Arc::new(move |ctx: WorkerContext| {
                let params = submit_params.clone();
                Box::pin(submit_worker::run(ctx, params))
            }),
        },
        WorkerSpec {
            kind: "notify".to_string(),
            count: config.notify_workers,
            assignable: false,
            factory: Arc::new(move |ctx: WorkerContext| {
                let params = notify_params.clone();
                Box::pin(notify_worker::run(ctx, params))
            }),
        },
    ];

    let metrics = Arc::new(Metrics::new(store.clone(), config.metrics_retention_days));
    let supervisor = Supervisor::new(supervisor::Params {
        store,
        registry,
        metrics,
        workers,
        rpc_timeout: config.rpc_timeout,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, closing");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        imap_workers = config.imap_workers,
        submit_workers = config.submit_workers,
        notify_workers = config.notify_workers,
        "mailsync starting"
    );
    supervisor.run(shutdown_rx).await?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(%err, "SIGTERM handler install failed");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Optional OAuth2 provider configs from `MAILSYNC_OAUTH2_PROVIDERS`
/// (JSON array of `{provider, clientId, clientSecret?, tokenUrl}`).
fn oauth2_providers() -> Result<Option<Vec<oauth2_refresh::ProviderConfig>>> {
    let Some(raw) = envfury::maybe::<String>("MAILSYNC_OAUTH2_PROVIDERS")? else {
        return Ok(None);
    };

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RawProvider {
        provider: String,
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        token_url: String,
    }

    let parsed: Vec<RawProvider> = serde_json::from_str(&raw)?;
    Ok(Some(
        parsed
            .into_iter()
            .map(|p| oauth2_refresh::ProviderConfig {
                provider: p.provider,
                client_id: p.client_id,
                client_secret: p.client_secret,
                token_url: p.token_url,
            })
            .collect(),
    ))
}

/// Re-encrypt every stored credential with a new secret.
async fn encrypt(config: EngineConfig, new_secret: &str) -> Result<()> {
    let store = open_store(&config).await?;
    let old_registry = Registry::new(
        store.clone(),
        SecretVault::new(config.encryption_secret.as_deref()),
    );
    let new_registry = Registry::new(store, SecretVault::new(Some(new_secret)));

    let mut rotated = 0usize;
    for id in old_registry.ids().await? {
        let Some(account) = old_registry.load(&id).await? else {
            continue;
        };
        let Some(credentials) = account.credentials else {
            continue;
        };
        new_registry
            .update(
                &id,
                AccountPatch {
                    credentials: Some(credentials),
                    ..Default::default()
                },
            )
            .await?;
        rotated += 1;
    }

    println!("re-encrypted credentials for {rotated} accounts");
    println!("restart the server with the new MAILSYNC_ENCRYPTION_SECRET");
    Ok(())
}

/// Print every live key with its kind.
async fn scan(config: EngineConfig) -> Result<()> {
    let store = open_store(&config).await?;
    for (key, kind) in store.scan_keys().await? {
        println!("{kind:8} {key}");
    }
    Ok(())
}

/// Set (or generate) the admin password.
async fn password_cmd(
    config: EngineConfig,
    password: Option<String>,
    print_hash: bool,
) -> Result<()> {
    let store = open_store(&config).await?;
    let settings = Settings::new(store);

    let (password, generated) = match password {
        Some(password) => (password, false),
        None => (api_tokens::generate_password(), true),
    };

    let stored = api_tokens::hash_password(&password)?;
    settings.set(ADMIN_PASSWORD_KEY, &stored).await?;

    if generated {
        println!("{password}");
    }
    if print_hash {
        println!("{}", api_tokens::hash_fingerprint(&stored));
    }
    Ok(())
}

/// Token management.
async fn tokens(config: EngineConfig, command: TokensCommand) -> Result<()> {
    let store = open_store(&config).await?;

    match command {
        TokensCommand::Issue {
            scopes,
            description,
        } => {
            let scopes: BTreeSet<api_tokens::Scope> = scopes
                .iter()
                .map(|scope| scope.parse())
                .collect::<Result<_, _>>()?;

            let issued = api_tokens::issue(scopes, description);
            let encoded = rmp_serde::to_vec_named(&issued.record)?;
            store
                .hash_set(TOKENS_KEY, &issued.record.id, encoded)
                .await?;

            println!("id:  {}", issued.record.id);
            println!("key: {}", issued.key);
        }
        TokensCommand::Export { id } => {
            let raw = store
                .hash_get(TOKENS_KEY, &id)
                .await?
                .ok_or_else(|| eyre!("no token with id {id}"))?;
            let record: api_tokens::TokenRecord = rmp_serde::from_slice(&raw)?;
            println!("{}", api_tokens::export(&record)?);
        }
        TokensCommand::Import { data } => {
            let record = api_tokens::import(&data)?;
            let encoded = rmp_serde::to_vec_named(&record)?;
            store.hash_set(TOKENS_KEY, &record.id, encoded).await?;
            println!("imported token {}", record.id);
        }
    }
    Ok(())
}
