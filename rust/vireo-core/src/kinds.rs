//! Element kinds storable in a value container.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The element kind of a value container.
///
/// Every container holds elements of exactly one kind, independent of whether
/// it represents a scalar or an array. The strum spellings are the type tags
/// used in assembly text (`int`, `float`, `bool`, `string`, `void`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum ValueKind {
    /// 64-bit signed integer.
    #[strum(serialize = "int")]
    Int64,
    /// 64-bit IEEE 754 float.
    #[strum(serialize = "float")]
    Float64,
    /// Boolean.
    #[strum(serialize = "bool")]
    Bool,
    /// Character string.
    #[strum(serialize = "string")]
    Text,
    /// Placeholder kind of an empty container or an unused operand slot.
    #[strum(serialize = "void")]
    Void,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_assembly_type_tags() {
        assert_eq!(ValueKind::from_str("int").unwrap(), ValueKind::Int64);
        assert_eq!(ValueKind::from_str("float").unwrap(), ValueKind::Float64);
        assert_eq!(ValueKind::from_str("bool").unwrap(), ValueKind::Bool);
        assert_eq!(ValueKind::from_str("string").unwrap(), ValueKind::Text);
        assert_eq!(ValueKind::from_str("void").unwrap(), ValueKind::Void);
    }

    #[test]
    fn rejects_unknown_type_tag() {
        assert!(ValueKind::from_str("complex").is_err());
    }

    #[test]
    fn displays_as_assembly_tag() {
        assert_eq!(ValueKind::Int64.to_string(), "int");
        assert_eq!(ValueKind::Text.as_ref(), "string");
    }
}
