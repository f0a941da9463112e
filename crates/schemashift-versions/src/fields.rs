//! Shorthand field constructors for snapshot declarations.

use schemashift_core::catalog::{DefaultValue, FieldDef, ScalarType};

/// UUID identity.
pub(crate) fn uuid(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::String).with_default(DefaultValue::AutoUuid)
}

/// Required text without default.
pub(crate) fn text(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::String)
}

/// Required text with a default.
pub(crate) fn text_or(name: &str, default: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::String).with_default(DefaultValue::String(default.to_string()))
}

/// Nullable text.
pub(crate) fn opt_text(name: &str) -> FieldDef {
    FieldDef::optional(name, ScalarType::String)
}

/// Integer with a default.
pub(crate) fn int(name: &str, default: i64) -> FieldDef {
    FieldDef::new(name, ScalarType::Int).with_default(DefaultValue::Int(default))
}

/// Required integer without default.
pub(crate) fn int_required(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Int)
}

/// Boolean with a default.
pub(crate) fn flag(name: &str, default: bool) -> FieldDef {
    FieldDef::new(name, ScalarType::Bool).with_default(DefaultValue::Bool(default))
}

/// JSON defaulting to `{}`.
pub(crate) fn dict(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Json).with_default(DefaultValue::empty_dict())
}

/// JSON defaulting to `[]`.
pub(crate) fn list(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Json).with_default(DefaultValue::empty_list())
}

/// Required JSON without default.
pub(crate) fn json(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Json)
}

/// Timestamp defaulting to the run time.
pub(crate) fn created(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Timestamp).with_default(DefaultValue::CurrentTimestamp)
}

/// Timestamp defaulting to the "never" sentinel.
pub(crate) fn never(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Timestamp).with_default(DefaultValue::NeverTimestamp)
}

/// Timestamp defaulting to the "unset" sentinel.
pub(crate) fn unset(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Timestamp).with_default(DefaultValue::NullTimestamp)
}

/// Required timestamp without default.
pub(crate) fn timestamp(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Timestamp)
}

/// Binary defaulting to empty.
pub(crate) fn blob(name: &str) -> FieldDef {
    FieldDef::new(name, ScalarType::Bytes).with_default(DefaultValue::Bytes(Vec::new()))
}
