pub mod log;
pub mod noop;
#[cfg(feature = "observability-prometheus")]
pub mod prometheus;
pub mod traits;

pub use self::log::LogObserver;
pub use noop::NoopObserver;
#[cfg(feature = "observability-prometheus")]
pub use self::prometheus::PrometheusObserver;
pub use traits::{Observer, ObserverEvent, ObserverMetric};

use crate::config::ObservabilityConfig;

/// Factory: create the right observer from config.
pub fn create_observer(config: &ObservabilityConfig) -> Box<dyn Observer> {
    match config.backend.as_str() {
        "log" => Box::new(LogObserver::new()),
        "prometheus" => {
            #[cfg(feature = "observability-prometheus")]
            {
                match PrometheusObserver::new() {
                    Ok(observer) => return Box::new(observer),
                    Err(e) => {
                        tracing::warn!("Prometheus observer unavailable ({e}); falling back to log");
                    }
                }
            }
            #[cfg(not(feature = "observability-prometheus"))]
            {
                tracing::warn!(
                    "Prometheus backend requested but this build was compiled without \
                     `observability-prometheus`; falling back to log"
                );
            }
            Box::new(LogObserver::new())
        }
        "none" | "noop" => Box::new(NoopObserver),
        other => {
            tracing::warn!("Unknown observability backend '{other}', falling back to noop");
            Box::new(NoopObserver)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn with_backend(backend: &str) -> ObservabilityConfig {
        ObservabilityConfig {
            backend: backend.into(),
        }
    }

    #[test]
    fn factory_log() {
        assert_eq!(create_observer(&with_backend("log")).name(), "log");
    }

    #[test]
    fn factory_none_and_noop() {
        assert_eq!(create_observer(&with_backend("none")).name(), "noop");
        assert_eq!(create_observer(&with_backend("noop")).name(), "noop");
    }

    #[test]
    fn factory_unknown_falls_back_to_noop() {
        assert_eq!(create_observer(&with_backend("xyzzy")).name(), "noop");
    }

    #[cfg(feature = "observability-prometheus")]
    #[test]
    fn factory_prometheus() {
        let observer = create_observer(&with_backend("prometheus"));
        assert_eq!(observer.name(), "prometheus");
        assert!(observer.as_any().downcast_ref::<PrometheusObserver>().is_some());
    }
}
