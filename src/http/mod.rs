//! HTTP layer for the git mirror.
//!
//! This module provides the axum-based HTTP server that dispatches git smart
//! HTTP and dumb-protocol requests to the mirrored repositories, enforces the
//! service access rules, and streams `git --stateless-rpc` output back to
//! clients.

pub mod access;
pub mod handler;
pub mod pktline;
pub mod routes;
pub mod static_files;
