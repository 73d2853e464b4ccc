//! Struct layouts - C field placement for struct descriptors

use super::descriptor::FfiType;
use crate::error::{Error, Result};
use std::sync::Arc;

/// One named field at a fixed byte offset
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: Arc<str>,
    pub offset: usize,
    pub ty: FfiType,
}

/// Native struct layout
#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    name: Arc<str>,
    size: usize,
    align: usize,
    fields: Vec<StructField>,
}

impl StructLayout {
    /// Lay fields out with C rules: each field at the next offset aligned
    /// to its own alignment, size rounded up to the largest alignment.
    pub fn new<N, I>(name: impl Into<Arc<str>>, fields: I) -> Result<Arc<Self>>
    where
        N: Into<Arc<str>>,
        I: IntoIterator<Item = (N, FfiType)>,
    {
        let name = name.into();
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut laid_out = Vec::new();

        for (field_name, ty) in fields {
            check_field_type(&name, &ty)?;
            let field_align = ty.native_align();
            offset = align_up(offset, field_align);
            align = align.max(field_align);
            laid_out.push(StructField {
                name: field_name.into(),
                offset,
                ty: ty.clone(),
            });
            offset += ty.native_size();
        }

        Ok(Arc::new(Self {
            name,
            size: align_up(offset, align),
            align,
            fields: laid_out,
        }))
    }

    /// Use offsets taken from an introspection database
    pub fn with_offsets<N, I>(name: impl Into<Arc<str>>, size: usize, fields: I) -> Result<Arc<Self>>
    where
        N: Into<Arc<str>>,
        I: IntoIterator<Item = (N, usize, FfiType)>,
    {
        let name = name.into();
        let mut align = 1usize;
        let mut laid_out = Vec::new();

        for (field_name, offset, ty) in fields {
            let field_name = field_name.into();
            check_field_type(&name, &ty)?;

            let field_align = ty.native_align();
            if offset % field_align != 0 {
                return Err(Error::descriptor(format!(
                    "field '{}.{}' at offset {} is not {}-byte aligned",
                    name, field_name, offset, field_align
                )));
            }
            let fits = offset
                .checked_add(ty.native_size())
                .map_or(false, |end| end <= size);
            if !fits {
                return Err(Error::descriptor(format!(
                    "field '{}.{}' overruns struct size {}",
                    name, field_name, size
                )));
            }

            align = align.max(field_align);
            laid_out.push(StructField {
                name: field_name,
                offset,
                ty,
            });
        }

        Ok(Arc::new(Self {
            name,
            size,
            align,
            fields: laid_out,
        }))
    }

    /// Struct whose fields are private; only its size is known
    pub fn opaque(name: impl Into<Arc<str>>, size: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            size,
            align: core::mem::align_of::<*const ()>(),
            fields: Vec::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| &*f.name == name)
    }
}

fn check_field_type(struct_name: &str, ty: &FfiType) -> Result<()> {
    match ty {
        FfiType::Void | FfiType::Ref(_) => Err(Error::descriptor(format!(
            "struct '{}' cannot hold a {} field",
            struct_name,
            ty.kind_name()
        ))),
        _ => Ok(()),
    }
}

#[inline]
pub(crate) const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}
