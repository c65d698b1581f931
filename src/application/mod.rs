//! Build pipeline and site workflow.

pub mod build;
pub mod cache;
pub mod error;
pub mod feed;
pub mod promote;
pub mod render;
pub mod site;
pub mod stubs;
