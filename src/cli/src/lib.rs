//! Kiln CLI - build OCI images from Dockerfiles.

pub mod commands;
pub mod output;
