//! Core domain types
//!
//! This module contains the core domain structures used across Shipyard services.
//! These types are shared between the orchestrator (persists and mutates them),
//! the provider adapters (produce canonical Git events) and the operator client.

pub mod build;
pub mod deployment;
pub mod event;
pub mod git;
pub mod service;
pub mod workflow;
