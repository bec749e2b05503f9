use thiserror::Error;

/// The failure kinds the engine reports.
///
/// Operations return `anyhow::Result`, so a `StorageError` usually arrives
/// wrapped in context. Use [`StorageError::kind_of`] to get it back.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Duplicate table or column, type mismatch on insert or compare.
    #[error("schema error: {0}")]
    Schema(String),

    /// The column has no index able to answer this kind of predicate.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Missing table, column, index or record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique index or key column already holds the key.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Metadata or a node failed a structural check while loading.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A split, merge or directory change reached a state it never should.
    #[error("capacity violation: {0}")]
    Capacity(String),
}

impl StorageError {
    /// Finds the `StorageError` at the root of an error chain, if there is one.
    pub fn kind_of(err: &anyhow::Error) -> Option<&StorageError> {
        err.chain().find_map(|cause| cause.downcast_ref::<StorageError>())
    }

    pub fn schema(msg: impl Into<String>) -> anyhow::Error {
        StorageError::Schema(msg.into()).into()
    }

    pub fn unsupported(msg: impl Into<String>) -> anyhow::Error {
        StorageError::UnsupportedOperation(msg.into()).into()
    }

    pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
        StorageError::NotFound(msg.into()).into()
    }

    pub fn duplicate_key(msg: impl Into<String>) -> anyhow::Error {
        StorageError::DuplicateKey(msg.into()).into()
    }

    pub fn corruption(msg: impl Into<String>) -> anyhow::Error {
        StorageError::Corruption(msg.into()).into()
    }

    pub fn capacity(msg: impl Into<String>) -> anyhow::Error {
        StorageError::Capacity(msg.into()).into()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::StorageError;

    #[test]
    fn kind_survives_context() {
        let err: anyhow::Result<()> = Err(StorageError::not_found("table users"));
        let err = err.context("while inserting").unwrap_err();
        assert_eq!(
            StorageError::kind_of(&err),
            Some(&StorageError::NotFound("table users".to_owned()))
        );
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::Error::msg("io went away");
        assert!(StorageError::kind_of(&err).is_none());
    }
}
