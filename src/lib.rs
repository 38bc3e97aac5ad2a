//! Pkgbulk - dependency-driven parallel package build orchestrator
//!
//! Given a tree of build recipes with inter-package dependencies, pkgbulk
//! computes a safe build order, executes each build inside an isolated
//! sandbox, runs builds concurrently up to a worker budget, and records
//! every outcome in a durable ledger so interrupted runs resume cleanly.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Business logic (graph, scheduler, recipes, reporting)
//! - [`infra`] - Infrastructure layer (storage, sandboxes, processes)
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;
