use std::sync::Once;

use tracing::Instrument;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing once. `RUST_LOG` controls filtering (default `info`);
/// `log_format` picks human-readable text or structured JSON lines.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).try_init()
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).try_init()
            }
        };
        init_result = Some(result.map_err(anyhow::Error::from));
    });
    init_result.unwrap_or(Ok(()))
}

/// Run an async test body with tracing installed, inside a `test` span named
/// after the test. Used by `#[lease_lock::test]`.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // Another subscriber may already be installed by the test harness.
    let _ = init(LogFormat::Text);
    f().instrument(tracing::info_span!("test", name = test_name)).await
}

/// Synchronous counterpart of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    let _span = tracing::info_span!("test", name = test_name).entered();
    f()
}
