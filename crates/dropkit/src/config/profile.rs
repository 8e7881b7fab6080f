//! Rate limiter presets trading speed against ban risk.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Predefined rate limiter profile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitProfile {
    /// Maximum protection, minimal risk of account blocking.
    Safe,
    /// Good balance between speed and safety.
    #[default]
    Balanced,
    /// Tuned for sellouts that last a few minutes.
    Fast,
    /// High-speed purchases, higher risk.
    Aggressive,
    /// Maximum speed, maximum risk.
    Extreme,
}

/// Values a profile fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSettings {
    pub max_wait: Duration,
    pub low_quota_pause: Duration,
    pub breaker_threshold: u32,
    pub breaker_duration: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
}

impl RateLimitProfile {
    pub const ALL: [RateLimitProfile; 5] = [
        RateLimitProfile::Safe,
        RateLimitProfile::Balanced,
        RateLimitProfile::Fast,
        RateLimitProfile::Aggressive,
        RateLimitProfile::Extreme,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            RateLimitProfile::Safe => "Maximum protection, minimal risk of account blocking",
            RateLimitProfile::Balanced => "Good balance between speed and safety (default)",
            RateLimitProfile::Fast => "Optimized for quick sellouts (2-6 minute window)",
            RateLimitProfile::Aggressive => "High-speed purchases, higher risk",
            RateLimitProfile::Extreme => "Maximum speed, maximum risk - emergencies only",
        }
    }

    pub fn settings(&self) -> ProfileSettings {
        let (max_wait, pause, threshold, breaker, retries, timeout) = match self {
            RateLimitProfile::Safe => (600, 120, 2, 600, 3, 45),
            RateLimitProfile::Balanced => (300, 60, 3, 300, 5, 30),
            RateLimitProfile::Fast => (60, 10, 5, 120, 4, 20),
            RateLimitProfile::Aggressive => (30, 5, 7, 60, 3, 15),
            RateLimitProfile::Extreme => (15, 2, 10, 30, 2, 10),
        };
        ProfileSettings {
            max_wait: Duration::from_secs(max_wait),
            low_quota_pause: Duration::from_secs(pause),
            breaker_threshold: threshold,
            breaker_duration: Duration::from_secs(breaker),
            max_retries: retries,
            request_timeout: Duration::from_secs(timeout),
        }
    }
}

impl fmt::Display for RateLimitProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitProfile::Safe => write!(f, "safe"),
            RateLimitProfile::Balanced => write!(f, "balanced"),
            RateLimitProfile::Fast => write!(f, "fast"),
            RateLimitProfile::Aggressive => write!(f, "aggressive"),
            RateLimitProfile::Extreme => write!(f, "extreme"),
        }
    }
}

impl FromStr for RateLimitProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(RateLimitProfile::Safe),
            "balanced" => Ok(RateLimitProfile::Balanced),
            "fast" => Ok(RateLimitProfile::Fast),
            "aggressive" => Ok(RateLimitProfile::Aggressive),
            "extreme" => Ok(RateLimitProfile::Extreme),
            other => Err(format!("unknown rate limit profile: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_is_default() {
        let settings = RateLimitProfile::default().settings();
        assert_eq!(settings.max_wait, Duration::from_secs(300));
        assert_eq!(settings.breaker_threshold, 3);
        assert_eq!(settings.max_retries, 5);
    }

    #[test]
    fn test_profiles_get_faster() {
        let waits: Vec<_> = RateLimitProfile::ALL
            .iter()
            .map(|p| p.settings().max_wait)
            .collect();
        assert!(waits.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_parse_round_trips_display() {
        for profile in RateLimitProfile::ALL {
            assert_eq!(profile.to_string().parse::<RateLimitProfile>(), Ok(profile));
        }
        assert!("reckless".parse::<RateLimitProfile>().is_err());
    }
}
