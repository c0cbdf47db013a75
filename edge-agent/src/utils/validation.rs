//! Input validation helpers
//!
//! Checks applied to operator input before any registration call.

use shared::error::AppError;
use shared::models::{RegistrationCommand, RegistrationIntervals};

/// Hosts are URLs; no host fits in more than this
pub const MAX_URL_LEN: usize = 2048;

/// Shortest allowed polling interval, in seconds
pub const MIN_INTERVAL_SECS: u64 = 1;

/// Validate that a required string is non-empty and within the length limit.
pub fn validate_required_text(value: &str, field: &str, max_len: usize) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} must not be empty")));
    }
    if value.len() > max_len {
        return Err(AppError::validation(format!(
            "{field} is too long ({} chars, max {max_len})",
            value.len()
        )));
    }
    Ok(())
}

/// Validate that a value is an absolute http(s) URL.
pub fn validate_http_url(value: &str, field: &str) -> Result<(), AppError> {
    validate_required_text(value, field, MAX_URL_LEN)?;
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    match rest {
        Some(authority) if !authority.is_empty() && !authority.starts_with('/') => Ok(()),
        _ => Err(AppError::validation(format!(
            "{field} must be an http(s) URL"
        ))),
    }
}

fn validate_interval(value: u64, field: &str) -> Result<(), AppError> {
    if value < MIN_INTERVAL_SECS {
        return Err(AppError::validation(format!(
            "{field} must be at least {MIN_INTERVAL_SECS} second"
        ))
        .with_detail("field", field));
    }
    Ok(())
}

/// Validate polling intervals, each at least one second.
pub fn validate_intervals(intervals: &RegistrationIntervals) -> Result<(), AppError> {
    validate_interval(intervals.command_refresh_interval, "commandRefreshInterval")?;
    validate_interval(intervals.command_retry_interval, "commandRetryInterval")?;
    validate_interval(intervals.message_retry_interval, "messageRetryInterval")
}

/// Validate a registration command: host, intervals and proxy.
pub fn validate_registration_command(command: &RegistrationCommand) -> Result<(), AppError> {
    validate_http_url(&command.host, "host")?;
    validate_intervals(&command.intervals)?;
    if command.use_proxy {
        let proxy_url = command.proxy_url.as_deref().unwrap_or_default();
        validate_http_url(proxy_url, "proxyUrl")?;
    }
    Ok(())
}

/// Strip trailing `/` from a host
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}
