use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use driftshare_engine::catalog::SharedCatalog;
use driftshare_engine::client::PeerClient;
use driftshare_engine::discovery::DiscoveryScanner;
use driftshare_engine::mdns::MdnsDiscovery;
use driftshare_engine::tcp::TcpConnector;

use crate::ui::{format_age, format_size, print_prompt};

pub type Client = PeerClient<TcpConnector, MdnsDiscovery>;
pub type Scanner = DiscoveryScanner<MdnsDiscovery>;

/// Everything the prompt commands act on.
pub struct Shell {
    pub scanner: Arc<Scanner>,
    pub client: Arc<Client>,
    pub catalog: Arc<SharedCatalog>,
    pub download_dir: PathBuf,
}

/// Outcome of one prompt line.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

impl Shell {
    /// Runs one prompt line.
    pub async fn dispatch(&self, line: &str) -> Flow {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();

        match parts.as_slice() {
            ["peers"] => self.peers(),
            ["scan"] => self.scan(),
            ["refresh"] => self.refresh(),
            ["files", addr] => self.files(addr).await,
            ["get", addr, name] => self.get(addr, name),
            ["ping", addr] => self.ping(addr).await,
            ["share", path] => self.share(path).await,
            ["unshare", name] => self.unshare(name),
            ["shared"] => self.shared(),
            ["help" | "?"] => crate::ui::print_help(),
            ["quit" | "exit" | "q"] => return Flow::Quit,
            ["files" | "ping" | "share" | "unshare", ..] | ["get", ..] => {
                println!("  Usage: {}", usage(parts[0]));
            }
            [other, ..] => {
                println!("  ❓ Unknown command: \"{other}\".  Type 'help' for usage.");
            }
            [] => {}
        }
        Flow::Continue
    }

    fn peers(&self) {
        let peers = self.scanner.peers();
        let status = self.scanner.status();
        if peers.is_empty() {
            println!("  No peers seen recently. Try 'scan'.");
        }
        let now = Instant::now();
        for peer in &peers {
            println!(
                "  • {:<24} {:<16} port {:<5}  seen {} ago",
                peer.display_name,
                peer.address,
                peer.service_port,
                format_age(peer.idle(now)),
            );
        }
        println!(
            "  {} visible, {} tracked, scanner {}",
            status.visible_peers,
            status.total_peers,
            if status.running { "running" } else { "stopped" }
        );
    }

    fn scan(&self) {
        let Some(handle) = self.scanner.discover_now() else {
            println!("  ❌ Scanner is stopped");
            return;
        };
        println!("  🔍 Scanning...");
        tokio::spawn(async move {
            if let Ok(confirmed) = handle.await {
                println!("\n  🔍 Scan finished: {confirmed} peer(s) offering files");
                print_prompt();
            }
        });
    }

    fn refresh(&self) {
        let scanner = Arc::clone(&self.scanner);
        println!("  🔄 Re-checking known peers...");
        tokio::spawn(async move {
            let removed = scanner.refresh_known_peers().await;
            println!("\n  🔄 Refresh finished: {removed} peer(s) removed");
            print_prompt();
        });
    }

    async fn files(&self, addr: &str) {
        let timeout = self.client.timeouts().list;
        match self.client.list_files(addr, timeout).await {
            Ok(files) if files.is_empty() => println!("  {addr} shares no files"),
            Ok(files) => {
                for file in files {
                    let hash = file.content_hash.as_deref().map_or("-", hash_prefix);
                    println!(
                        "  • {:<32} {:>12}  {hash}",
                        file.name,
                        format_size(file.size_bytes)
                    );
                }
            }
            Err(e) => println!("  ❌ Cannot list files on {addr}: {e}"),
        }
    }

    fn get(&self, addr: &str, name: &str) {
        let Some(destination) = download_target(&self.download_dir, name) else {
            println!("  ❌ \"{name}\" is not a valid file name");
            return;
        };
        let client = Arc::clone(&self.client);
        let addr = addr.to_owned();
        let name = name.to_owned();
        println!("  📥 Downloading \"{name}\" from {addr}...");
        tokio::spawn(async move {
            let timeout = client.timeouts().fetch;
            match client.fetch_file(&addr, &name, &destination, timeout).await {
                Ok(bytes) => println!("\n  ✅ \"{name}\" saved ({})", format_size(bytes)),
                Err(e) => println!("\n  ❌ Download of \"{name}\" failed: {e}"),
            }
            print_prompt();
        });
    }

    async fn ping(&self, addr: &str) {
        let timeout = self.client.timeouts().ping;
        let started = Instant::now();
        if self.client.ping(addr, timeout).await {
            println!("  🏓 {addr} answered in {} ms", started.elapsed().as_millis());
        } else {
            println!("  ❌ {addr} did not answer");
        }
    }

    async fn share(&self, path: &str) {
        match add_shared(&self.catalog, path).await {
            Ok(name) => println!("  📤 Sharing \"{name}\""),
            Err(e) => println!("  ❌ Cannot share {path}: {e}"),
        }
    }

    fn unshare(&self, name: &str) {
        match self.catalog.remove(name) {
            Ok(true) => println!("  🚫 Stopped sharing \"{name}\""),
            Ok(false) => println!("  \"{name}\" was not shared"),
            Err(e) => println!("  ❌ Cannot update catalog: {e:#}"),
        }
    }

    fn shared(&self) {
        let entries = self.catalog.entries();
        if entries.is_empty() {
            println!("  Nothing shared yet. Use 'share <path>'.");
            return;
        }
        for (name, entry) in &entries {
            let marker = if entry.path.is_file() { " " } else { "!" };
            println!(
                "  {marker} {name:<32} {:>12}  {}",
                format_size(entry.size),
                entry.path.display()
            );
        }
        let summary = self.catalog.summary();
        println!(
            "  {} file(s), {} available",
            summary.total_files,
            format_size(summary.total_size)
        );
    }
}

fn usage(command: &str) -> &'static str {
    match command {
        "files" => "files <addr>",
        "get" => "get <addr> <name>",
        "ping" => "ping <addr>",
        "share" => "share <path>",
        _ => "unshare <name>",
    }
}

/// Adds `path` to the catalog on the blocking pool, since adding hashes
/// the whole file. Returns the shared name or a printable error.
async fn add_shared(catalog: &Arc<SharedCatalog>, path: &str) -> Result<String, String> {
    let catalog = Arc::clone(catalog);
    let owned = path.to_owned();
    match tokio::task::spawn_blocking(move || catalog.add(owned)).await {
        Ok(Ok(name)) => Ok(name),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(e) => Err(e.to_string()),
    }
}

/// The first 12 characters of a peer-supplied hash, for display.
fn hash_prefix(hash: &str) -> &str {
    hash.char_indices().nth(12).map_or(hash, |(end, _)| &hash[..end])
}

/// Where a download of `name` lands. Only the final path component of
/// `name` is used, so a peer-supplied name cannot escape `dir`.
fn download_target(dir: &Path, name: &str) -> Option<PathBuf> {
    let file_name = Path::new(name).file_name()?;
    Some(dir.join(file_name))
}
