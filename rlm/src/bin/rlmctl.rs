//! rlmctl - command-line client for the RLM lease server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rlm::{
    api::ForceReleaseAction,
    client::{HttpLeaseApi, LeaseApi, LeaseController},
    config::ControllerConfig,
    lease::{LeaseScope, LeaseType, ScopeSelector},
    presentation, PrincipalId, ResourceId,
};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// rlmctl - resource lease manager client
#[derive(Parser, Debug)]
#[command(name = "rlmctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Lease server base URL
    #[arg(long, env = "RLM_SERVER", default_value = "http://127.0.0.1:7400")]
    server: String,

    /// Principal to act as (sent in the x-principal-id header)
    #[arg(short, long, env = "RLM_PRINCIPAL")]
    principal: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show lease state of a resource
    Status {
        resource: String,
        #[arg(short, long, default_value = "ASSESS")]
        scope: LeaseScope,
        /// Print the raw status document
        #[arg(long)]
        json: bool,
    },

    /// Acquire or renew a lease
    Acquire {
        resource: String,
        #[arg(short, long, default_value = "ASSESS")]
        scope: LeaseScope,
        /// Take a SHARED lease instead of EXCLUSIVE
        #[arg(long)]
        shared: bool,
    },

    /// Release your own lease
    Release {
        resource: String,
        #[arg(short, long, default_value = "ASSESS")]
        scope: LeaseScope,
        #[arg(long)]
        shared: bool,
    },

    /// Hold the EXCLUSIVE lease while editing; Ctrl-C releases it
    Edit {
        resource: String,
        #[arg(short, long, default_value = "ASSESS")]
        scope: LeaseScope,
        /// Status poll interval in seconds
        #[arg(long, default_value = "300")]
        poll: u64,
    },

    /// Full lease history of a resource (admin)
    Debug { resource: String },

    /// Deactivate leases regardless of expiry
    ForceRelease {
        resource: String,
        /// Scope name or ALL
        #[arg(short, long, default_value = "ALL")]
        scope: ScopeSelector,
        /// Release every holder's leases, not only your own (admin)
        #[arg(long)]
        all_holders: bool,
    },
}

fn lease_type(shared: bool) -> LeaseType {
    if shared {
        LeaseType::Shared
    } else {
        LeaseType::Exclusive
    }
}

async fn edit(api: HttpLeaseApi, resource: ResourceId, scope: LeaseScope, config: ControllerConfig) -> Result<()> {
    let api: Arc<dyn LeaseApi> = Arc::new(api);
    let controller = LeaseController::new(api, resource, scope, config);
    let mut views = controller.subscribe();

    let view = controller.activate().await;
    println!("{}", presentation::render(&view, chrono::Utc::now()));
    if !controller.acquire().await? {
        println!("Staying read-only; waiting for the lock to free up (Ctrl-C to quit)");
        let interrupted = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                true
            }
            acquired = controller.acquire_when_free() => {
                acquired?;
                println!("Lock is free; now editing");
                false
            }
        };
        if interrupted {
            controller.shutdown().await;
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                println!("{}", presentation::render(&view, chrono::Utc::now()));
            }
        }
    }

    controller.shutdown().await;
    println!("Released");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let timeout = Duration::from_secs(cli.timeout);
    let api = HttpLeaseApi::new(&cli.server, PrincipalId::from(cli.principal), timeout)
        .context("failed to build HTTP client")?;

    match cli.command {
        Commands::Status { resource, scope, json } => {
            let status = api.status(&ResourceId::from(resource), scope).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if status.has_exclusive_lock {
                println!(
                    "EXCLUSIVE held by {} until {} (canEdit={})",
                    status.holder.map(|h| h.to_string()).unwrap_or_default(),
                    status.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    status.can_edit
                );
            } else {
                println!(
                    "No exclusive lock ({} shared holders, canEdit={})",
                    status.shared_holders, status.can_edit
                );
            }
        }
        Commands::Acquire { resource, scope, shared } => {
            let resource = ResourceId::from(resource);
            match api.acquire(&resource, scope, lease_type(shared)).await {
                Ok(acquired) => println!(
                    "{} {} lease on {}/{} until {}",
                    if acquired.renewed { "Renewed" } else { "Acquired" },
                    lease_type(shared),
                    resource,
                    scope,
                    acquired.expires_at.to_rfc3339()
                ),
                Err(rlm::Error::LeaseConflict { holder, expires_at, .. }) => {
                    println!("Locked by {} until {}", holder, expires_at.to_rfc3339());
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Release { resource, scope, shared } => {
            let response = api
                .release(&ResourceId::from(resource), scope, lease_type(shared))
                .await?;
            if response.released {
                println!("Released");
            } else {
                println!("Already released");
            }
        }
        Commands::Edit { resource, scope, poll } => {
            let config = ControllerConfig {
                poll_interval: Duration::from_secs(poll.max(1)),
                request_timeout: timeout,
                ..ControllerConfig::default()
            };
            edit(api, ResourceId::from(resource), scope, config).await?;
        }
        Commands::Debug { resource } => {
            let history = api.history(&ResourceId::from(resource)).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::ForceRelease {
            resource,
            scope,
            all_holders,
        } => {
            let action = if all_holders {
                ForceReleaseAction::ForceReleaseAll
            } else {
                ForceReleaseAction::ForceReleaseUser
            };
            let count = api
                .force_release(&ResourceId::from(resource), scope, action)
                .await?;
            println!("Released {count} leases");
        }
    }

    Ok(())
}
