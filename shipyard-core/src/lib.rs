//! Shipyard Core
//!
//! Core types and abstractions for the Shipyard deployment control plane.
//!
//! This crate contains:
//! - Domain types: Service, Build, Deployment, Workflow and the canonical event envelope
//! - DTOs: legacy representations and operator API payloads
//! - Translator: the anti-corruption boundary between the two

pub mod domain;
pub mod dto;
pub mod translator;
