use std::{net::SocketAddr, path::Path};

use eyre::Result;

use crate::config::models::{ReservedRoutesConfig, ScriptConfig, ServerConfig, SessionConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Reserved route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.webapps_dir.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "webapps_dir".to_string(),
            });
        } else if !Path::new(&config.webapps_dir).is_dir() {
            errors.push(ValidationError::InvalidField {
                field: "webapps_dir".to_string(),
                message: format!("Directory '{}' does not exist", config.webapps_dir),
            });
        }

        if config.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_body_bytes".to_string(),
                message: "Body limit must be greater than 0".to_string(),
            });
        }

        errors.extend(Self::validate_reserved(&config.reserved));
        errors.extend(Self::validate_session(&config.session));
        errors.extend(Self::validate_scripts(&config.scripts));

        if config.reload.enabled && config.reload.debounce_ms > 60_000 {
            errors.push(ValidationError::InvalidField {
                field: "reload.debounce_ms".to_string(),
                message: "Debounce must not exceed one minute".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_reserved(reserved: &ReservedRoutesConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("reserved.resources_prefix", &reserved.resources_prefix),
            ("reserved.status_path", &reserved.status_path),
        ] {
            if !value.starts_with('/') || value.len() < 2 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("'{value}' must start with '/' and not be the root path"),
                });
            }
        }

        if reserved.resources_prefix == reserved.status_path {
            errors.push(ValidationError::RouteConflict {
                message: format!(
                    "resources_prefix and status_path are both '{}'",
                    reserved.status_path
                ),
            });
        }

        if let Some(favicon) = &reserved.favicon {
            if !Path::new(favicon).is_file() {
                errors.push(ValidationError::InvalidField {
                    field: "reserved.favicon".to_string(),
                    message: format!("File '{favicon}' does not exist"),
                });
            }
        }

        if let Some(dir) = &reserved.resources_dir {
            if !Path::new(dir).is_dir() {
                errors.push(ValidationError::InvalidField {
                    field: "reserved.resources_dir".to_string(),
                    message: format!("Directory '{dir}' does not exist"),
                });
            }
        }

        errors
    }

    fn validate_session(session: &SessionConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let is_token = !session.cookie_name.is_empty()
            && session
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !is_token {
            errors.push(ValidationError::InvalidField {
                field: "session.cookie_name".to_string(),
                message: format!(
                    "'{}' is not a valid cookie name (use letters, digits, '_', '-', '.')",
                    session.cookie_name
                ),
            });
        }

        if session.idle_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "session.idle_timeout_secs".to_string(),
                message: "Idle timeout must be greater than 0".to_string(),
            });
        }

        if session.sweep_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "session.sweep_interval_secs".to_string(),
                message: "Sweep interval must be greater than 0".to_string(),
            });
        }

        errors
    }

    fn validate_scripts(scripts: &ScriptConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if scripts.extension.is_empty()
            || !scripts.extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            errors.push(ValidationError::InvalidField {
                field: "scripts.extension".to_string(),
                message: format!(
                    "'{}' must be a non-empty alphanumeric extension without a dot",
                    scripts.extension
                ),
            });
        }

        let limits = [
            ("scripts.max_operations", scripts.max_operations as usize),
            ("scripts.max_call_levels", scripts.max_call_levels),
            ("scripts.max_string_size", scripts.max_string_size),
            ("scripts.max_array_size", scripts.max_array_size),
            ("scripts.max_map_size", scripts.max_map_size),
        ];
        for (field, value) in limits {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Script limits must be greater than 0".to_string(),
                });
            }
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn minimal_valid_config(dir: &TempDir) -> ServerConfig {
        ServerConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .webapps_dir(dir.path().to_str().unwrap())
            .build()
    }

    #[test]
    fn validate_accepts_defaults_with_existing_webapps_dir() {
        let dir = TempDir::new().unwrap();
        assert!(ServerConfigValidator::validate(&minimal_valid_config(&dir)).is_ok());
    }

    #[test]
    fn validate_rejects_missing_webapps_dir() {
        let config = ServerConfig::builder()
            .webapps_dir("/definitely/not/here")
            .build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_cookie_name_and_zero_limits() {
        let dir = TempDir::new().unwrap();
        let mut config = minimal_valid_config(&dir);
        config.session.cookie_name = "bad name;".to_string();
        config.scripts.max_operations = 0;

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Found 2 validation errors"), "{message}");
    }

    #[test]
    fn validate_rejects_conflicting_reserved_routes() {
        let dir = TempDir::new().unwrap();
        let mut config = minimal_valid_config(&dir);
        config.reserved.status_path = "/_static".to_string();

        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_invalid_listen_address() {
        let dir = TempDir::new().unwrap();
        let mut config = minimal_valid_config(&dir);
        config.listen_addr = "localhost".to_string();

        assert!(ServerConfigValidator::validate(&config).is_err());
    }
}
