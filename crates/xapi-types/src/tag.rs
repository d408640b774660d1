//! Correlation tag codec
//!
//! Every request frame carries `customTag = "{command}_{transactionId}"`.
//! Replies echo the tag, which is how an inbound frame finds the call that
//! caused it.

use crate::ids::TransactionId;

/// Separator between the command and the transaction id
pub const TAG_SEPARATOR: char = '_';

/// Decoded correlation tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTag {
    /// Logical command name
    pub command: String,
    /// Transaction the frame belongs to
    pub transaction_id: TransactionId,
}

impl CustomTag {
    /// Create a tag for a command/transaction pair
    pub fn new(command: impl Into<String>, transaction_id: TransactionId) -> Self {
        Self {
            command: command.into(),
            transaction_id,
        }
    }

    /// Render the wire form
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.command, TAG_SEPARATOR, self.transaction_id)
    }

    /// Parse the wire form, splitting on the first separator
    ///
    /// Returns `None` when the separator is missing or either half is empty.
    pub fn parse(tag: &str) -> Option<Self> {
        let (command, transaction_id) = tag.split_once(TAG_SEPARATOR)?;
        if command.is_empty() || transaction_id.is_empty() {
            return None;
        }
        Some(Self {
            command: command.to_string(),
            transaction_id: TransactionId::from(transaction_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tag = CustomTag::new("getVersion", TransactionId::from("17"));
        assert_eq!(tag.encode(), "getVersion_17");

        let decoded = CustomTag::parse("getVersion_17").expect("valid tag");
        assert_eq!(decoded.command, "getVersion");
        assert_eq!(decoded.transaction_id.as_str(), "17");
    }

    #[test]
    fn test_tag_without_separator() {
        assert_eq!(CustomTag::parse("getVersion17"), None);
        assert_eq!(CustomTag::parse(""), None);
    }

    #[test]
    fn test_tag_splits_on_first_separator() {
        let decoded = CustomTag::parse("ping_1700000000000_0003").expect("valid tag");
        assert_eq!(decoded.command, "ping");
        assert_eq!(decoded.transaction_id.as_str(), "1700000000000_0003");
    }

    #[test]
    fn test_tag_empty_halves() {
        assert_eq!(CustomTag::parse("_17"), None);
        assert_eq!(CustomTag::parse("getVersion_"), None);
    }
}
