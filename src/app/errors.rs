#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// The backend answered with a non-success status. `message` is what the
    /// user should see.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("reqwest error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Message suitable for showing to the user as the session error.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Rejected { message, .. } => message.clone(),
            AppError::Reqwest(err) => match err.status() {
                Some(status) => status
                    .canonical_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| status.to_string()),
                None => format!("request failed: {err}"),
            },
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_uses_rejection_text() {
        let err = AppError::Rejected {
            status: 422,
            message: "no faces found".to_string(),
        };
        assert_eq!(err.user_message(), "no faces found");
        assert_eq!(err.to_string(), "no faces found");
    }
}
