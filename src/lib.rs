//! Test generation and validation for dynamic content sections.
//!
//! Sections are markup templates or small scripts. Test cases bind variables,
//! run the section in a sandbox and compare the output with an expectation.
//! A generative backend proposes new cases and repairs failing ones.

pub mod backend;
pub mod contexts;
pub mod data;
pub mod document_store;
pub mod errors;
pub mod registries;
pub mod snippet;
