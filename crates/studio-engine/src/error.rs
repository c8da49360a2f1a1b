use thiserror::Error;

/// Every failure the engine can surface to the panel.
///
/// `Display` is the user-visible message; item-level variants end up inside a
/// `GenerationOutcome::Failure`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StudioError {
    /// Missing or malformed user input. A batch never starts.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Credential(String),
    #[error("{0}")]
    Transport(String),
    /// The service answered but carried no usable image.
    #[error("{0}")]
    ResponseShape(String),
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    Save(String),
}

impl StudioError {
    pub fn missing_credential() -> Self {
        Self::Credential("Missing credential".to_string())
    }

    pub fn no_image_in_response() -> Self {
        Self::ResponseShape("No image in response".to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Credential(_) => "credential",
            Self::Transport(_) => "transport",
            Self::ResponseShape(_) => "response_shape",
            Self::Decode(_) => "decode",
            Self::Save(_) => "save",
        }
    }
}

pub type StudioResult<T> = std::result::Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::StudioError;

    #[test]
    fn display_is_the_bare_message() {
        assert_eq!(
            StudioError::missing_credential().to_string(),
            "Missing credential"
        );
        assert_eq!(
            StudioError::no_image_in_response().to_string(),
            "No image in response"
        );
        assert_eq!(StudioError::Save("disk full".into()).kind(), "save");
    }
}
