//! Egress identity listing.

use std::path::Path;

use dropkit::config::Settings;
use dropkit::IdentityPool;

/// Print the identities a burst would spread its workers over.
pub fn cmd_proxies(settings: &Settings, file: Option<&Path>) -> anyhow::Result<()> {
    let path = file.unwrap_or(&settings.proxies_file);
    let pool = IdentityPool::from_file(path)?;

    if pool.is_empty() {
        println!("No proxies in {}; bursts use one direct worker", path.display());
        return Ok(());
    }

    println!("{} proxies from {}", pool.len(), path.display());
    for (i, proxy) in pool.proxies().iter().enumerate() {
        let auth = if proxy.has_credentials() { " (auth)" } else { "" };
        println!("  {:>3}. {}{}", i + 1, proxy, auth);
    }

    let workers = settings.pool.worker_count(pool.len());
    println!();
    println!("A burst would start {} worker(s)", workers);
    Ok(())
}
