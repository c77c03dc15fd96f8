use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use std::sync::Arc;

use shutterpay::config::Config;
use shutterpay::db::{AppState, Collaborators, create_pool, init_db};
use shutterpay::email::EmailService;
use shutterpay::handlers;
use shutterpay::idempotency::MokaEventCache;
use shutterpay::maintenance::{RegenerationOptions, regenerate_tokens};
use shutterpay::payments::StripeGateway;
use shutterpay::storage::LocalPhotoStore;

#[derive(Parser, Debug)]
#[command(name = "shutterpay")]
#[command(about = "Payment settlement and secure photo downloads for a photographer marketplace")]
struct Cli {
    /// Regenerate download tokens instead of starting the server
    #[arg(long)]
    regenerate_tokens: bool,

    /// Only regenerate grants that have already expired (for --regenerate-tokens)
    #[arg(long, requires = "regenerate_tokens")]
    expired_only: bool,

    /// Only regenerate grants for this order (for --regenerate-tokens)
    #[arg(long, requires = "regenerate_tokens")]
    order_id: Option<i64>,

    /// Report what would be regenerated without changing anything
    #[arg(long, requires = "regenerate_tokens")]
    dry_run: bool,

    /// Days until regenerated grants expire
    #[arg(long, default_value_t = 7)]
    extend_days: i64,
}

fn run_regeneration(state: &AppState, opts: &RegenerationOptions) -> Result<(), String> {
    println!("Download Token Regeneration");
    println!("===========================");
    println!();
    if opts.dry_run {
        println!("DRY RUN: no changes will be made");
        println!();
    }

    let summary = regenerate_tokens(&state.links, &state.db, opts).map_err(|e| e.to_string())?;

    if summary.matched == 0 {
        println!("No downloads found matching criteria.");
        return Ok(());
    }

    println!("Found {} download(s) to regenerate.", summary.matched);
    println!();
    println!("Regeneration complete:");
    println!("  Regenerated: {}", summary.regenerated);
    println!("  Skipped:     {}", summary.skipped);
    println!("  Errors:      {}", summary.errors);

    if summary.errors > 0 {
        return Err(format!(
            "Regeneration completed with {} error(s). Review the log output.",
            summary.errors
        ));
    }
    if opts.dry_run {
        println!();
        println!("Run again without --dry-run to apply.");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shutterpay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    });

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let gateway = StripeGateway::new(
        config.stripe_secret_key.clone().unwrap_or_default(),
        config.gateway_timeout,
    )
    .expect("Failed to build Stripe client");
    if config.stripe_secret_key.is_none() {
        tracing::warn!("STRIPE_SECRET_KEY not set - gateway calls will be rejected");
    }

    let collaborators = Collaborators {
        gateway: Arc::new(gateway),
        notifier: Arc::new(EmailService::new(
            config.resend_api_key.clone(),
            config.email_from.clone(),
        )),
        photos: Arc::new(LocalPhotoStore::new(&config.storage_root)),
        event_cache: Arc::new(MokaEventCache::new(config.webhook_dedup_ttl)),
    };
    let state =
        AppState::new(&config, db_pool, collaborators).expect("Failed to initialize application");

    if cli.regenerate_tokens {
        let opts = RegenerationOptions {
            expired_only: cli.expired_only,
            order_id: cli.order_id,
            dry_run: cli.dry_run,
            extend_days: cli.extend_days,
        };
        if let Err(e) = run_regeneration(&state, &opts) {
            eprintln!();
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let app = handlers::app(state, config.rate_limit);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Shutterpay server listening on {}", addr);

    // Connect info is required for per-IP rate limiting
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
