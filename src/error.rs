pub type PreshadeResult<T> = Result<T, PreshadeError>;

#[derive(thiserror::Error, Debug)]
pub enum PreshadeError {
    #[error("comment error: {0}")]
    Comment(String),

    #[error("directive error: {0}")]
    Directive(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PreshadeError {
    pub fn comment(msg: impl Into<String>) -> Self {
        Self::Comment(msg.into())
    }

    pub fn directive(msg: impl Into<String>) -> Self {
        Self::Directive(msg.into())
    }

    pub fn expression(msg: impl Into<String>) -> Self {
        Self::Expression(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            PreshadeError::comment("x")
                .to_string()
                .contains("comment error:")
        );
        assert!(
            PreshadeError::directive("x")
                .to_string()
                .contains("directive error:")
        );
        assert!(
            PreshadeError::expression("x")
                .to_string()
                .contains("expression error:")
        );
        assert!(PreshadeError::io("x").to_string().contains("io error:"));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = PreshadeError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
