use chatrooms::{api, config::Config, entity::User, store::Store};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the subscriber so RUST_LOG from it applies
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        // Not fatal, the environment may already be set
        info!("No .env file found or failed to load: {}", e);
    }

    info!("Chatrooms service starting...");

    let config = Config::from_env()?;

    info!("Initializing store at {}", config.database_path.display());
    let store = Store::new(&config.database_path).await?;
    store.init().await?;

    for (name, token) in &config.bootstrap_users {
        if store.find_user_by_token(token).await?.is_none() {
            let user = User::new(name.as_str(), token.as_str());
            store.create_user(&user).await?;
            info!("Provisioned user {}", user);
        }
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let service = chatrooms::build(store, &config);
    let worker_handle = tokio::spawn(service.worker.run(service.tasks));
    let app = api::router(service.state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = worker_handle => {
            error!("Message worker stopped unexpectedly");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
