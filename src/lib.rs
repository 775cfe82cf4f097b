#![forbid(unsafe_code)]

//! # lattice_core
//!
//! Execution core for Lattice integrations. An integration is a named set of
//! data-collection steps against a third-party provider; this crate runs those
//! steps in dependency order, assembles the collected data into a graph of
//! entities and relationships buffered on disk, and uploads the graph to the
//! persister synchronization service in batches.
//!
//! The crate knows no provider. Provider clients, configuration loading, and
//! the command-line driver are external collaborators; they hand this crate an
//! [`config::IntegrationInvocationConfig`] and a
//! [`sync::DynSynchronizationApi`] and receive an
//! [`execution::ExecutionReport`] back.

mod error;

pub mod config;
pub mod entity;
pub mod events;
pub mod execution;
pub mod logger;
pub mod storage;
pub mod sync;

pub use error::{IntegrationError, Result, UNEXPECTED_ERROR_REASON};
