//! Input validation module
//!
//! Runs the `validator` derive rules and adds the semantic checks the derive
//! cannot express (phone numbers, reachability of contacts).

use tracing::{debug, warn};
use validator::{Validate, ValidationErrors};

use crate::error::{AppError, AppResult};
use crate::gateway::is_plausible_phone_number;
use crate::models::{ClientInput, ContactInput, DispatcherInput};

/// Longest SMS text accepted (three concatenated segments)
pub const MAX_SMS_LENGTH: usize = 480;

/// Run struct-level validation and turn failures into a readable message
pub fn validate_input<T: Validate>(input: &T) -> AppResult<()> {
    if let Err(validation_errors) = input.validate() {
        let message = describe_errors(&validation_errors);
        warn!(errors = %message, "Input validation failed");
        return Err(AppError::ValidationError(message));
    }
    Ok(())
}

fn describe_errors(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .map(|(field, errors)| {
            let msgs: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, msgs.join(", "))
        })
        .collect();

    if messages.is_empty() {
        // nested struct errors only
        return errors.to_string();
    }
    messages.sort();
    messages.join("; ")
}

/// Validate an optional phone field
pub fn validate_phone(field: &str, value: Option<&str>) -> AppResult<()> {
    match value {
        Some(number) if !is_plausible_phone_number(number) => Err(AppError::ValidationError(
            format!("{}: '{}' is not a valid phone number", field, number),
        )),
        _ => Ok(()),
    }
}

/// Validate a mandatory phone field
pub fn require_phone(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::ValidationError(format!("{}: must not be empty", field)));
    }
    validate_phone(field, Some(value))
}

pub fn validate_client_input(input: &ClientInput) -> AppResult<()> {
    validate_input(input)?;
    validate_phone("phone", input.phone.as_deref())?;

    if input.birth_date > chrono::Utc::now().date_naive() {
        return Err(AppError::ValidationError(
            "birthDate: must not be in the future".to_string(),
        ));
    }

    debug!("Client input validation passed");
    Ok(())
}

/// A contact must be reachable by at least one valid number
pub fn validate_contact_input(input: &ContactInput) -> AppResult<()> {
    validate_input(input)?;
    validate_phone("phone", input.phone.as_deref())?;
    validate_phone("mobile", input.mobile.as_deref())?;

    let has_number = [input.phone.as_deref(), input.mobile.as_deref()]
        .iter()
        .flatten()
        .any(|n| !n.trim().is_empty());
    if !has_number {
        return Err(AppError::ValidationError(
            "Contact needs a phone or mobile number".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_dispatcher_input(input: &DispatcherInput) -> AppResult<()> {
    validate_input(input)?;
    validate_phone("phone", input.phone.as_deref())
}

/// Validate SMS text length
pub fn validate_sms_text(message: &str) -> AppResult<()> {
    let length = message.chars().count();
    if length == 0 || length > MAX_SMS_LENGTH {
        return Err(AppError::ValidationError(format!(
            "message: length must be between 1 and {}",
            MAX_SMS_LENGTH
        )));
    }
    Ok(())
}

/// Validate pagination parameters
pub fn validate_pagination(page: Option<u32>, limit: Option<u32>) -> AppResult<(u32, u32)> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(50);

    if page == 0 {
        return Err(AppError::ValidationError(
            "Page number must be greater than 0".to_string(),
        ));
    }

    if limit == 0 || limit > 500 {
        return Err(AppError::ValidationError(
            "Limit must be between 1 and 500".to_string(),
        ));
    }

    Ok((page, limit))
}
