// ABOUTME: Security module root
// ABOUTME: Hosts the audit trail shared by the authorizer and key administration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

/// Audit entries, sink trait and the buffered writer
pub mod audit;

pub use audit::{
    AuditEntry, AuditKind, AuditLog, AuditOutcome, AuditQuery, AuditSink, AuditStats, ChainBreak,
    ChainVerification,
};
