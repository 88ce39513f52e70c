//! Delivery port - the downstream notification channel.
//!
//! The core does not know whether a channel sends SMS, email or push. It calls
//! [`Delivery::deliver`] once per attempt and lets [`DeliveryError`]'s
//! classification decide whether a failure is worth retrying.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Classify, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Channel hiccup (network, rate limit, 5xx); may succeed later.
    #[error("delivery failed: {0}")]
    Transient(String),

    /// Channel refused the message itself; retrying cannot help.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

impl Classify for DeliveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transient(_) => ErrorKind::DeliveryTransient,
            DeliveryError::Rejected(_) => ErrorKind::StructuralValidation,
        }
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, message: &str) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<D: Delivery + ?Sized> Delivery for Arc<D> {
    async fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        (**self).deliver(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskError;
    use rstest::rstest;

    #[rstest]
    #[case(DeliveryError::Transient("gateway timeout".into()), ErrorKind::DeliveryTransient)]
    #[case(DeliveryError::Rejected("invalid recipient".into()), ErrorKind::StructuralValidation)]
    fn classifies_by_variant(#[case] err: DeliveryError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn rejection_keeps_its_text_through_task_error() {
        let err = TaskError::classify(&DeliveryError::Rejected("invalid recipient".into()));

        assert_eq!(err.kind(), ErrorKind::StructuralValidation);
        assert_eq!(err.message(), "delivery rejected: invalid recipient");
    }
}
