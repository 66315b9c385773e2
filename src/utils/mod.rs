//! The `utils` module provides shared definitions used across `topicbus`:
//! the broker error type and logging initialization.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, EntityKind};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn not_found_error_names_entity() {
        let err = BrokerError::NotFound {
            kind: EntityKind::Queue,
            name: "orders".to_string(),
        };
        assert_eq!(err.to_string(), "queue 'orders' not found");
    }
}
