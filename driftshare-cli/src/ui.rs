use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "GiB"), (1 << 20, "MiB"), (1 << 10, "KiB")];

    UNITS
        .iter()
        .find(|(scale, _)| bytes >= *scale)
        .map_or_else(
            || format!("{bytes} B"),
            |(scale, unit)| format!("{:.2} {unit}", bytes as f64 / *scale as f64),
        )
}

/// Formats how long ago something happened (`"5s"`, `"3m 12s"`).
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with device info.
pub fn print_banner(device_name: &str, port: u16, catalog: &Path, download_dir: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                🛶  driftshare  CLI                  ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Device   : {device_name:<40} ║");
    println!("║  Port     : {port:<40} ║");
    println!("║  Catalog  : {:<40} ║", catalog.display().to_string());
    println!("║  Save to  : {:<40} ║", download_dir.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    peers                   List peers seen recently");
    println!("    scan                    Scan for peers now");
    println!("    refresh                 Re-check every known peer");
    println!("    files <addr>            List the files a peer shares");
    println!("    get <addr> <name>       Download a file from a peer");
    println!("    ping <addr>             Check that a peer answers");
    println!("    share <path>            Offer a local file to peers");
    println!("    unshare <name>          Stop offering a file");
    println!("    shared                  List the files you share");
    println!("    help                    Show this help");
    println!("    quit                    Shut down and exit");
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
