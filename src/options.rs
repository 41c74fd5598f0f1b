use std::time::Duration;

pub const MAX_DEPTH_ENV: &str = "STACKWALK_MAX_DEPTH";
pub const ATTACH_TIMEOUT_ENV: &str = "STACKWALK_ATTACH_TIMEOUT_MS";

/// Settings shared by all capture methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    /// The maximum number of frames in a trace.
    pub max_depth: usize,
    /// How long to wait for a remote target to stop after attaching.
    pub attach_timeout: Duration,
    /// Whether to resolve symbols and modules for the captured frames.
    pub symbolicate: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_depth: 100,
            attach_timeout: Duration::from_secs(5),
            symbolicate: true,
        }
    }
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The defaults, overridden by `STACKWALK_MAX_DEPTH` and
    /// `STACKWALK_ATTACH_TIMEOUT_MS` when those are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(value) = lookup(MAX_DEPTH_ENV) {
            match value.trim().parse::<usize>() {
                Ok(max_depth) => options.max_depth = max_depth,
                Err(e) => log::warn!("Ignoring {MAX_DEPTH_ENV}={value:?}: {e}"),
            }
        }
        if let Some(value) = lookup(ATTACH_TIMEOUT_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => options.attach_timeout = Duration::from_millis(ms),
                Err(e) => log::warn!("Ignoring {ATTACH_TIMEOUT_ENV}={value:?}: {e}"),
            }
        }
        options
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn attach_timeout(mut self, attach_timeout: Duration) -> Self {
        self.attach_timeout = attach_timeout;
        self
    }

    pub fn symbolicate(mut self, symbolicate: bool) -> Self {
        self.symbolicate = symbolicate;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let options = CaptureOptions::default();
        assert_eq!(options.max_depth, 100);
        assert_eq!(options.attach_timeout, Duration::from_secs(5));
        assert!(options.symbolicate);
    }

    #[test]
    fn overrides() {
        let options = CaptureOptions::from_lookup(|name| match name {
            MAX_DEPTH_ENV => Some("12".to_string()),
            ATTACH_TIMEOUT_ENV => Some(" 250 ".to_string()),
            _ => None,
        });
        assert_eq!(options.max_depth, 12);
        assert_eq!(options.attach_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let options = CaptureOptions::from_lookup(|name| match name {
            MAX_DEPTH_ENV => Some("lots".to_string()),
            ATTACH_TIMEOUT_ENV => Some("-1".to_string()),
            _ => None,
        });
        assert_eq!(options, CaptureOptions::default());
    }

    #[test]
    fn builder() {
        let options = CaptureOptions::new().max_depth(3).symbolicate(false);
        assert_eq!(options.max_depth, 3);
        assert!(!options.symbolicate);
    }
}
