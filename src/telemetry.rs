use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if cfg.json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(feature = "server")]
pub use self::http::log_requests;

#[cfg(feature = "server")]
mod http {
    use std::time::Instant;

    use axum::extract::Request;
    use axum::middleware::Next;
    use axum::response::Response;

    /// `axum::middleware::from_fn` layer logging one line per request.
    pub async fn log_requests(request: Request, next: Next) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let started = Instant::now();

        let response = next.run(request).await;

        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if status.is_server_error() {
            tracing::warn!(%method, %path, status = status.as_u16(), elapsed_ms, "request failed");
        } else {
            tracing::info!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let cfg = LoggingConfig::default();
        init_tracing(&cfg);
        init_tracing(&LoggingConfig {
            level: "not a ==== directive".into(),
            json: true,
        });
    }
}
