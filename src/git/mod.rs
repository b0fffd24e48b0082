//! Git subprocess plumbing.
//!
//! All git computation is delegated to the `git` binary through
//! `tokio::process::Command`: one-shot commands live in [`commands`], the
//! streaming stateless-RPC bridge in [`bridge`].

pub mod bare_repo;
pub mod bridge;
pub mod commands;
