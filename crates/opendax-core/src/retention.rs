// SPDX-License-Identifier: MIT

//! The retention contract: a backend that mirrors RETAIN-flagged tags.
//!
//! `opendax-core` only depends on this trait; concrete backends (flat file,
//! SQLite) live in `opendax-persistence` so the core crate stays free of
//! storage-engine dependencies, mirroring how `hdds`'s core library stays
//! independent of `hdds-persistence`.

use crate::types::TagType;

/// A persisted CDT definition, materialized before any tags are restored.
#[derive(Debug, Clone)]
pub struct RetainedType {
    pub spec: String,
}

/// A persisted tag definition plus its last-known bytes.
#[derive(Debug, Clone)]
pub struct RetainedTag {
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
    pub attr: u16,
    pub data: Vec<u8>,
}

/// Backend that mirrors RETAIN-flagged tags across restarts.
///
/// Implementations must tolerate being constructed against an empty or
/// freshly created store. `opendax-server` restores persisted state by first
/// calling [`RetentionStore::load_types`] (in declaration order) then
/// [`RetentionStore::load_tags`], `tag_add`-ing each before copying its bytes
/// in.
pub trait RetentionStore: Send {
    /// Returns every persisted CDT spec, in the order they were declared.
    fn load_types(&mut self) -> crate::error::Result<Vec<RetainedType>>;

    /// Returns every live (non-tombstoned) persisted tag.
    fn load_tags(&mut self) -> crate::error::Result<Vec<RetainedTag>>;

    /// Records a newly created RETAIN tag.
    fn record_tag(&mut self, tag: &RetainedTag) -> crate::error::Result<()>;

    /// Persists new data for an already-recorded RETAIN tag.
    fn persist_write(
        &mut self,
        name: &str,
        offset: u32,
        data: &[u8],
    ) -> crate::error::Result<()>;

    /// Records a newly created CDT in declaration order.
    fn record_type(&mut self, spec: &str) -> crate::error::Result<()>;

    /// Removes (or tombstones) a tag's record.
    fn remove_tag(&mut self, name: &str) -> crate::error::Result<()>;
}

/// A `RetentionStore` that discards everything. Used when the server is
/// started without a retention backend configured.
#[derive(Debug, Default)]
pub struct NullRetentionStore;

impl RetentionStore for NullRetentionStore {
    fn load_types(&mut self) -> crate::error::Result<Vec<RetainedType>> {
        Ok(Vec::new())
    }

    fn load_tags(&mut self) -> crate::error::Result<Vec<RetainedTag>> {
        Ok(Vec::new())
    }

    fn record_tag(&mut self, _tag: &RetainedTag) -> crate::error::Result<()> {
        Ok(())
    }

    fn persist_write(
        &mut self,
        _name: &str,
        _offset: u32,
        _data: &[u8],
    ) -> crate::error::Result<()> {
        Ok(())
    }

    fn record_type(&mut self, _spec: &str) -> crate::error::Result<()> {
        Ok(())
    }

    fn remove_tag(&mut self, _name: &str) -> crate::error::Result<()> {
        Ok(())
    }
}
