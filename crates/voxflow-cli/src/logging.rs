use tracing_subscriber::EnvFilter;

use voxflow_core::config::LoggingConfig;

/// Filter directives: base level first, then per-target overrides.
fn directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.level.clone().unwrap_or_else(|| "info".into())
    };
    std::iter::once(level)
        .chain(config.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over the config file.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config, verbose)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (config.format.as_str(), config.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["voxflow_speech=trace".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(directives(&config, false), "warn,voxflow_speech=trace");
        assert_eq!(directives(&config, true), "debug,voxflow_speech=trace");
        assert_eq!(directives(&LoggingConfig::default(), false), "info");
    }
}
