//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG: &str = "STOCKROOM_LOG";

/// Map a `STOCKROOM_LOG` value to a level. Unset or unknown means info.
pub fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

pub fn filter_directives(level: &str) -> String {
    format!("stockroom={level},stockroom_cli={level}")
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
///
/// `RUST_LOG` wins over `STOCKROOM_LOG`; `LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(ENV_LOG).ok().as_deref());
        EnvFilter::new(filter_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("loud")), "info");
    }

    #[test]
    fn directives_cover_both_crates() {
        assert_eq!(
            filter_directives("debug"),
            "stockroom=debug,stockroom_cli=debug"
        );
    }
}
