//! # Tessera Server
//!
//! Runs the room server authority in process, wires it to the federation
//! outbound queue, and serves the internal room server API over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tessera_common::ServerName;
use tessera_db::Database;
use tessera_federation::{OutboundQueue, QueueingSender};
use tessera_roomserver::{MemoryRoomStore, RoomServerAuthority, RoomStorage, ServerAcls};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - room server and federation outbound queue", long_about = None)]
struct Cli {
    /// Config file; defaults to an optional config.toml in the working directory
    #[arg(short, long, env = "TESSERA_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = tessera_common::config::init(cli.config.as_deref())?;
    config.verify()?;

    tracing::info!("Starting Tessera v{}", env!("CARGO_PKG_VERSION"));
    let server_name = ServerName::new(config.server.name.clone());

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;

    // === Room server ===
    let storage: Arc<dyn RoomStorage> = Arc::new(MemoryRoomStore::new());
    let acls = Arc::new(ServerAcls::load(server_name.clone(), storage.as_ref()).await?);
    let authority = RoomServerAuthority::new(server_name.clone(), &config.room_server, storage, Some(acls));

    // === Federation sender ===
    // The sender consults the authority for ACLs, so it is attached after both exist.
    let queue = OutboundQueue::new(db);
    let sender = QueueingSender::new(queue, Arc::new(authority.clone()), &config.federation);
    authority.set_federation_sender(Arc::new(sender))?;

    let router = tessera_api::internal_router(Arc::new(authority));
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.internal_api_port);
    tracing::info!(server_name = %server_name, "Room server internal API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
