use std::fmt;

/// Sensor name validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum SensorNameError {
    Empty,
    InvalidFormat(String),
}

impl fmt::Display for SensorNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorNameError::Empty => write!(f, "sensor name is required"),
            SensorNameError::InvalidFormat(s) => write!(
                f,
                "invalid sensor name '{}': must be lowercase segments separated by dots",
                s
            ),
        }
    }
}

impl std::error::Error for SensorNameError {}

/// Validates sensor name format.
///
/// Valid sensor names:
/// - Lowercase letters (a-z)
/// - Numbers (0-9)
/// - Underscores and dashes inside segments
/// - Dots (.) for hierarchy
/// - No leading/trailing dots
/// - No consecutive dots
pub fn validate_sensor_name(name: &str) -> Result<(), SensorNameError> {
    if name.is_empty() {
        return Err(SensorNameError::Empty);
    }

    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(SensorNameError::InvalidFormat(name.to_string()));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    if !valid_chars {
        return Err(SensorNameError::InvalidFormat(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_valid_sensor_names() {
        assert!(validate_sensor_name("cpu").is_ok());
        assert!(validate_sensor_name("cpu.load").is_ok());
        assert!(validate_sensor_name("webapp.reqs.per_sec").is_ok());
        assert!(validate_sensor_name("service-up").is_ok());
        assert!(validate_sensor_name("a.b.c.d").is_ok());
    }

    #[test]
    fn test_invalid_sensor_names() {
        assert_eq!(validate_sensor_name(""), Err(SensorNameError::Empty));
        assert!(validate_sensor_name(".cpu").is_err());
        assert!(validate_sensor_name("cpu.").is_err());
        assert!(validate_sensor_name("cpu..load").is_err());
        assert!(validate_sensor_name("CPU").is_err());
        assert!(validate_sensor_name("cpu/load").is_err());
        assert!(validate_sensor_name("cpu load").is_err());
    }
}
