use serde::{Deserialize, Serialize};

/// Longest name the hello endpoint will greet.
pub const MAX_NAME_LENGTH: usize = 100;

/// Largest single counter increment.
pub const MAX_INCREMENT: u64 = 1_000;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

/// Request body for `POST /api/hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

impl HelloRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "name cannot be empty"));
        } else if self.name.chars().count() > MAX_NAME_LENGTH {
            errors.push(ValidationError::new("name", "name must be at most 100 characters"));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Request body for `POST /api/counter/increment`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementRequest {
    /// Defaults to 1.
    pub amount: Option<u64>,
}

impl IncrementRequest {
    pub fn amount(&self) -> u64 {
        self.amount.unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.amount() == 0 {
            errors.push(ValidationError::new("amount", "amount must be positive"));
        }
        if self.amount() > MAX_INCREMENT {
            errors.push(ValidationError::new("amount", "amount must be at most 1000"));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
