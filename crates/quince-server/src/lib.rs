//! Quince server
//!
//! HTTP surface for config long polling, reads and publishing, plus the
//! startup wiring of every component.

pub mod api;
pub mod model;
pub mod startup;
