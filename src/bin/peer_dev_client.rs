//! Developer smoke client: launches the native host as a child process and
//! runs a peer against the in-memory page until interrupted.
//!
//! Usage: `peer-dev-client [host-binary] [profile-id]`

use std::env;
use std::path::PathBuf;
use synapse_bridge::config::Config;
use synapse_bridge::dispatch::memory::{Element, MemoryPage};
use synapse_bridge::peer::process::ProcessConnector;
use synapse_bridge::peer::{PeerActor, PeerConfig, PeerNotice};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    run().await
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn default_host_binary() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let exe = env::current_exe()?;
    let dir = exe.parent().ok_or("executable has no parent directory")?;
    Ok(dir.join(format!("synapse-bridge{}", env::consts::EXE_SUFFIX)))
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let mut args = env::args().skip(1);
    let host = match args.next() {
        Some(path) => PathBuf::from(path),
        None => default_host_binary()?,
    };
    let profile_id = args.next().unwrap_or_else(|| Uuid::new_v4().to_string());

    let connector = ProcessConnector::new(&host, vec!["host".to_string(), profile_id.clone()])
        .with_limits(
            config.host.max_inbound_message_bytes,
            config.host.max_outbound_frame_bytes,
        );

    let mut page = MemoryPage::new();
    if let Some(tab) = page.active_tab_id() {
        page.insert_element(tab, "#search", Element::input());
        page.insert_element(tab, "#submit", Element::button("Search"));
        page.insert_element(tab, "input[type=file]", Element::file_input());
    }

    let peer_config = PeerConfig::from_config(&config, profile_id.as_str(), "dev");
    let (actor, mut handle) = PeerActor::new(connector, page, peer_config);
    println!("peer {} -> {}", profile_id, host.display());
    let actor_task = tokio::spawn(actor.run());

    loop {
        tokio::select! {
            notice = handle.next_notice() => match notice {
                Some(PeerNotice::ReconnectAbandoned { attempts }) => {
                    println!("giving up after {attempts} reconnect attempts");
                    break;
                }
                Some(notice) => println!("{notice:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    let actor = actor_task.await?;
    println!(
        "stopped: handshake={:?} lock_active={}",
        actor.session().handshake_state(),
        actor.dispatcher().safety_lock().is_active()
    );
    Ok(())
}
