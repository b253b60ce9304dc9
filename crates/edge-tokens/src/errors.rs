use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("unknown token type: {0}")]
    UnknownType(String),
    #[error("duplicate token secret for ids {first} and {second}")]
    DuplicateSecret { first: u64, second: u64 },
    #[error("duplicate token id {id}")]
    DuplicateId { id: u64 },
}

pub type TokenResult<T> = Result<T, TokenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let errors = vec![
            TokenError::UnknownType("admin".to_string()),
            TokenError::DuplicateSecret {
                first: 1,
                second: 2,
            },
            TokenError::DuplicateId { id: 3 },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
