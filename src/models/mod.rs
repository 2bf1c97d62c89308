//! Core data model of the document service.
//!
//! `Document` maps to the `documents` table via `sqlx::FromRow`; the id,
//! blob key and storage locator types keep the addressing scheme in one place.

pub mod document;
