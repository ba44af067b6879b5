use std::fmt;
use std::hash::{Hash, Hasher};

use crate::tables::TableId;
use crate::{Error, Result};

/// A metadata token identifying one logical metadata row.
///
/// Tokens consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table
/// - The low 24 bits (bits 0-23) indicate the 1-based row id (RID) within that table
///
/// Tokens are stable once the owning table buffer has been finalized; before finalization
/// only a logical row key exists, not a token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table and a 1-based row id.
    ///
    /// # Errors
    /// Returns [`Error::FormatLimit`] if `rid` does not fit the 24-bit row id field.
    pub fn from_parts(table: TableId, rid: u32) -> Result<Self> {
        if rid > 0x00FF_FFFF {
            return Err(Error::FormatLimit {
                message: format!("row id {rid} exceeds the 24-bit RID field of table {table}"),
            });
        }
        Ok(Token((table as u32) << 24 | rid))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table index from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the table this token refers to, if the index is a known table.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_repr(self.table())
    }

    /// Extracts the 1-based row id from the token (low 24 bits)
    #[must_use]
    pub fn rid(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, rid: {})",
            self.0,
            self.table(),
            self.rid()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_parts() {
        let token = Token::from_parts(TableId::MethodDef, 1).unwrap();
        assert_eq!(token.value(), 0x0600_0001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.table_id(), Some(TableId::MethodDef));
        assert_eq!(token.rid(), 1);
    }

    #[test]
    fn test_token_rid_limit() {
        assert!(Token::from_parts(TableId::TypeDef, 0x00FF_FFFF).is_ok());
        assert!(matches!(
            Token::from_parts(TableId::TypeDef, 0x0100_0000),
            Err(Error::FormatLimit { .. })
        ));
    }

    #[test]
    fn test_token_null() {
        assert!(Token::new(0).is_null());
        assert!(!Token::from_parts(TableId::Module, 1).unwrap().is_null());
    }

    #[test]
    fn test_token_display() {
        let token = Token::from_parts(TableId::CustomAttribute, 0x42).unwrap();
        assert_eq!(format!("{token}"), "0x0c000042");
    }
}
