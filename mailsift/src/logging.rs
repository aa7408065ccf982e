use tracing_subscriber::EnvFilter;

/// Initialize tracing for logging.
///
/// Debug builds default to debug logs for this crate and info for others;
/// release builds default to info. `RUST_LOG` overrides both. Logs go to
/// stderr so command output on stdout stays clean.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mailsift=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // Ignore the error when a subscriber is already installed (tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn fmt_ms(d: std::time::Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 { "<1ms".into() } else { format!("{}ms", ms) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fmt_ms() {
        assert_eq!(fmt_ms(Duration::from_micros(300)), "<1ms");
        assert_eq!(fmt_ms(Duration::from_millis(42)), "42ms");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init();
        init();
    }
}
