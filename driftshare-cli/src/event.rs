use tokio::sync::broadcast;

use driftshare_engine::events::ShareEvent;

use crate::ui::print_prompt;

/// Spawns a task that prints every engine event as it arrives.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<ShareEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    println!("\n  {}", describe(&event));
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// One-line, user-facing rendering of an event.
fn describe(event: &ShareEvent) -> String {
    match event {
        ShareEvent::PeerConnected { address, port } => {
            format!("📡 {address}:{port} connected")
        }
        ShareEvent::PeerDisconnected { address, port } => {
            format!("👋 {address}:{port} disconnected")
        }
        ShareEvent::PeerFound(peer) => format!(
            "✨ Found \"{}\" at {} (port {})",
            peer.display_name, peer.address, peer.service_port
        ),
        ShareEvent::PeerLost(peer) => {
            format!("💨 Lost \"{}\" at {}", peer.display_name, peer.address)
        }
        ShareEvent::FileReceived {
            filename,
            address,
            path,
        } => format!(
            "🎉 Received \"{filename}\" from {address} → {}",
            path.display()
        ),
        ShareEvent::Log { message } => format!("ℹ {message}"),
    }
}
