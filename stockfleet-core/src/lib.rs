//! Core domain models for the Stockfleet orchestrator
//!
//! This crate contains the message envelope and its wire codec, the command
//! model, the workflow state machine, agent registration records and the
//! orchestrator configuration shared by the transport and engine crates.

pub mod agent;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod workflow;

pub use error::{Error, Result};
