//! Profile listing.

use dropkit::config::Settings;
use dropkit::RateLimitProfile;

/// Print every rate limiter profile and what it fixes.
pub fn cmd_profiles(settings: &Settings) -> anyhow::Result<()> {
    println!(
        "{:<11} {:>8} {:>7} {:>9} {:>8} {:>7} {:>8}",
        "PROFILE", "MAX WAIT", "PAUSE", "THRESHOLD", "BREAKER", "RETRIES", "TIMEOUT"
    );
    for profile in RateLimitProfile::ALL {
        let preset = profile.settings();
        let marker = if profile == settings.profile { "*" } else { " " };
        println!(
            "{}{:<10} {:>7}s {:>6}s {:>9} {:>7}s {:>7} {:>7}s",
            marker,
            profile.to_string(),
            preset.max_wait.as_secs(),
            preset.low_quota_pause.as_secs(),
            preset.breaker_threshold,
            preset.breaker_duration.as_secs(),
            preset.max_retries,
            preset.request_timeout.as_secs(),
        );
    }

    println!();
    for profile in RateLimitProfile::ALL {
        println!("  {:<10} {}", profile.to_string(), profile.description());
    }
    Ok(())
}
