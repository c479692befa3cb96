// ABOUTME: Configuration module root
// ABOUTME: Re-exports the environment-driven server configuration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Configuration loaded from environment variables

/// Environment and server configuration
pub mod environment;

pub use environment::{AuditConfig, DatabaseUrl, Environment, SecurityConfig, ServerConfig};
