//! Serialized descriptor form emitted by the binding generator
//!
//! Every optional field the runtime requires is checked in `TryFrom`, so a
//! descriptor missing its ownership tag fails here rather than defaulting.

use super::descriptor::{
    ArrayLength, BoxedType, CallbackScope, FfiType, FloatWidth, IntWidth, ListKind, Ownership,
    Trampoline,
};
use super::layout::StructLayout;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RawFfiType {
    Void,
    Boolean,
    Int {
        size: u8,
        #[serde(default)]
        unsigned: bool,
    },
    Float {
        size: u8,
    },
    String {
        ownership: Option<Ownership>,
    },
    #[serde(rename_all = "camelCase")]
    Struct {
        inner_type: String,
        ownership: Option<Ownership>,
        size: Option<usize>,
        #[serde(default)]
        fields: Vec<RawField>,
        #[serde(default)]
        by_value: bool,
    },
    #[serde(rename_all = "camelCase")]
    Boxed {
        inner_type: String,
        ownership: Option<Ownership>,
        lib: Option<String>,
        get_type_fn: Option<String>,
    },
    #[serde(alias = "gobject")]
    Object {
        ownership: Option<Ownership>,
        class: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Array {
        item_type: Option<Box<RawFfiType>>,
        list_type: Option<ListKind>,
        fixed_size: Option<usize>,
        ownership: Option<Ownership>,
    },
    #[serde(rename_all = "camelCase")]
    Ref {
        inner_type: Option<Box<RawFfiType>>,
    },
    #[serde(rename_all = "camelCase")]
    Callback {
        trampoline: Option<Trampoline>,
        scope: Option<CallbackScope>,
        #[serde(default)]
        arg_types: Vec<RawFfiType>,
        return_type: Option<Box<RawFfiType>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub offset: Option<usize>,
    #[serde(rename = "type")]
    pub ty: RawFfiType,
}

fn required(ownership: Option<Ownership>, kind: &str) -> Result<Ownership> {
    ownership.ok_or_else(|| Error::descriptor(format!("{} descriptor is missing 'ownership'", kind)))
}

impl TryFrom<RawFfiType> for FfiType {
    type Error = Error;

    fn try_from(raw: RawFfiType) -> Result<Self> {
        Ok(match raw {
            RawFfiType::Void => FfiType::Void,
            RawFfiType::Boolean => FfiType::Boolean,
            RawFfiType::Int { size, unsigned } => FfiType::Int {
                width: IntWidth::from_bits(size)?,
                unsigned,
            },
            RawFfiType::Float { size } => FfiType::Float(FloatWidth::from_bits(size)?),
            RawFfiType::String { ownership } => FfiType::string(required(ownership, "string")?),
            RawFfiType::Struct {
                inner_type,
                ownership,
                size,
                fields,
                by_value,
            } => {
                let ownership = required(ownership, "struct")?;
                let layout = struct_layout(inner_type, size, fields)?;
                if by_value {
                    FfiType::struct_value(layout)?
                } else {
                    FfiType::struct_ptr(layout, ownership)
                }
            }
            RawFfiType::Boxed {
                inner_type,
                ownership,
                lib,
                get_type_fn,
            } => {
                let ownership = required(ownership, "boxed")?;
                let boxed = BoxedType {
                    type_name: inner_type.into(),
                    library: lib.map(Into::into),
                    get_type: get_type_fn.map(Into::into),
                };
                FfiType::boxed(boxed, ownership)
            }
            RawFfiType::Object { ownership, class } => FfiType::Object {
                ownership: required(ownership, "object")?,
                class: class.map(Into::into),
            },
            RawFfiType::Array {
                item_type,
                list_type,
                fixed_size,
                ownership,
            } => {
                let item = item_type
                    .ok_or_else(|| Error::descriptor("array descriptor is missing 'itemType'"))?;
                let length = match fixed_size {
                    Some(n) => ArrayLength::Fixed(n),
                    None => ArrayLength::ZeroTerminated,
                };
                FfiType::array_with(
                    FfiType::try_from(*item)?,
                    list_type.unwrap_or(ListKind::Array),
                    length,
                    required(ownership, "array")?,
                )?
            }
            RawFfiType::Ref { inner_type } => {
                let inner = inner_type
                    .ok_or_else(|| Error::descriptor("ref descriptor is missing 'innerType'"))?;
                FfiType::reference(FfiType::try_from(*inner)?)?
            }
            RawFfiType::Callback {
                trampoline,
                scope,
                arg_types,
                return_type,
            } => {
                let trampoline = trampoline
                    .ok_or_else(|| Error::descriptor("callback descriptor is missing 'trampoline'"))?;
                let arg_types = arg_types
                    .into_iter()
                    .map(FfiType::try_from)
                    .collect::<Result<Vec<_>>>()?;
                let return_type = match return_type {
                    Some(ret) => FfiType::try_from(*ret)?,
                    None => FfiType::Void,
                };
                FfiType::callback(
                    trampoline,
                    scope.unwrap_or(CallbackScope::Forever),
                    arg_types,
                    return_type,
                )?
            }
        })
    }
}

fn struct_layout(name: String, size: Option<usize>, fields: Vec<RawField>) -> Result<Arc<StructLayout>> {
    let name: Arc<str> = name.into();

    if fields.iter().all(|f| f.offset.is_some()) && !fields.is_empty() {
        let size = size.ok_or_else(|| {
            Error::descriptor(format!("struct '{}' has field offsets but no size", name))
        })?;
        let fields = fields
            .into_iter()
            .map(|f| Ok((f.name, f.offset.unwrap_or_default(), FfiType::try_from(f.ty)?)))
            .collect::<Result<Vec<_>>>()?;
        return StructLayout::with_offsets(name, size, fields);
    }

    if fields.is_empty() {
        let size = size.ok_or_else(|| {
            Error::descriptor(format!("struct '{}' needs either 'size' or 'fields'", name))
        })?;
        return Ok(StructLayout::opaque(name, size));
    }

    let fields = fields
        .into_iter()
        .map(|f| Ok((f.name, FfiType::try_from(f.ty)?)))
        .collect::<Result<Vec<_>>>()?;
    let layout = StructLayout::new(name, fields)?;
    if let Some(size) = size {
        if size != layout.size() {
            return Err(Error::descriptor(format!(
                "struct '{}' declares size {} but its fields need {}",
                layout.name(),
                size,
                layout.size()
            )));
        }
    }
    Ok(layout)
}

impl FfiType {
    /// Parse a generator-emitted JSON descriptor
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawFfiType = serde_json::from_str(json)?;
        Self::try_from(raw)
    }
}
