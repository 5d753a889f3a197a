//! Device fingerprinting
//!
//! Derives a stable identifier for a browser profile from the signals its
//! environment exposes. The same signals always produce the same fingerprint.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Environment signals observable from inside a tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSignals {
    pub user_agent: String,
    pub language: String,
    pub platform: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u8,
    pub timezone: String,
    pub hardware_concurrency: u16,
}

impl Default for EnvironmentSignals {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36".to_string(),
            language: "en-US".to_string(),
            platform: "Win32".to_string(),
            screen_width: 1920,
            screen_height: 1080,
            color_depth: 24,
            timezone: "UTC".to_string(),
            hardware_concurrency: 8,
        }
    }
}

impl EnvironmentSignals {
    /// Short "Browser on Platform" label
    pub fn user_agent_signature(&self) -> String {
        let ua = self.user_agent.as_str();
        // Order matters: Edge and Chrome both advertise Safari
        let browser = if ua.contains("Edg/") {
            "Edge"
        } else if ua.contains("Firefox/") {
            "Firefox"
        } else if ua.contains("Chrome/") {
            "Chrome"
        } else if ua.contains("Safari/") {
            "Safari"
        } else {
            "Browser"
        };

        let platform = if ua.contains("Windows") {
            "Windows"
        } else if ua.contains("Android") {
            "Android"
        } else if ua.contains("iPhone") || ua.contains("iPad") {
            "iOS"
        } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
            "macOS"
        } else if ua.contains("Linux") {
            "Linux"
        } else {
            "Unknown"
        };

        format!("{} on {}", browser, platform)
    }
}

/// Stable per-profile device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    pub fn from_signals(signals: &EnvironmentSignals) -> Self {
        let canonical = [
            signals.user_agent.clone(),
            signals.language.clone(),
            signals.platform.clone(),
            format!("{}x{}", signals.screen_width, signals.screen_height),
            signals.color_depth.to_string(),
            signals.timezone.clone(),
            signals.hardware_concurrency.to_string(),
        ]
        .join("|");

        Self(format!("fp_{:016x}", xxh3_64(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let signals = EnvironmentSignals::default();
        assert_eq!(
            DeviceFingerprint::from_signals(&signals),
            DeviceFingerprint::from_signals(&signals.clone())
        );
        assert!(DeviceFingerprint::from_signals(&signals)
            .as_str()
            .starts_with("fp_"));
    }

    #[test]
    fn test_any_signal_changes_fingerprint() {
        let base = EnvironmentSignals::default();
        let moved = EnvironmentSignals {
            timezone: "Europe/Berlin".to_string(),
            ..base.clone()
        };
        let resized = EnvironmentSignals {
            screen_width: 2560,
            ..base.clone()
        };

        let fp = DeviceFingerprint::from_signals(&base);
        assert_ne!(fp, DeviceFingerprint::from_signals(&moved));
        assert_ne!(fp, DeviceFingerprint::from_signals(&resized));
    }

    #[test]
    fn test_user_agent_signature() {
        assert_eq!(
            EnvironmentSignals::default().user_agent_signature(),
            "Chrome on Windows"
        );

        let firefox = EnvironmentSignals {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
                .to_string(),
            ..EnvironmentSignals::default()
        };
        assert_eq!(firefox.user_agent_signature(), "Firefox on Linux");
    }
}
