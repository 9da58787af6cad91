//! # strand-core
//!
//! Foundation types for the Strand agent engine.
//!
//! This crate provides the shared vocabulary that all other Strand crates
//! depend on:
//!
//! - **Branded IDs**: [`ids::LogId`], [`ids::RunId`], [`ids::ConversationId`]
//!   as newtypes
//! - **Logs**: [`logs::Log`] closed enum — input events, thoughts, tool
//!   calls/results, outputs, step markers
//! - **Working memory**: [`memory::WorkingMemory`], the run-scoped ordered
//!   log buffer used to build the next prompt
//! - **Errors**: [`errors::EngineError`] taxonomy via `thiserror`
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other strand crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod logs;
pub mod memory;
