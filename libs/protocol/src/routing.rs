//! Routing instructions handed between the two processors.

use crate::{ProtocolError, ProtocolResult};

/// The unit placed on a hand-off queue: publish `data` verbatim to every
/// subject in `targets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInstruction {
    /// Destination subjects, never empty
    pub targets: Vec<String>,

    /// Request identifier, carried for logging and diagnostics
    pub req: String,

    /// Fully serialized envelope, ready to publish
    pub data: String,
}

impl RoutingInstruction {
    pub fn new(
        targets: Vec<String>,
        req: impl Into<String>,
        data: impl Into<String>,
    ) -> ProtocolResult<Self> {
        if targets.is_empty() {
            return Err(ProtocolError::EmptyTargets);
        }

        Ok(Self {
            targets,
            req: req.into(),
            data: data.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_targets() {
        let result = RoutingInstruction::new(vec![], "r1", "{}");
        assert!(matches!(result, Err(ProtocolError::EmptyTargets)));
    }

    #[test]
    fn test_carries_fields() {
        let instruction =
            RoutingInstruction::new(vec!["a".to_string(), "b".to_string()], "r1", "{}")
                .unwrap();
        assert_eq!(instruction.targets.len(), 2);
        assert_eq!(instruction.req, "r1");
        assert_eq!(instruction.data, "{}");
    }
}
