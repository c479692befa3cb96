// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence
// ABOUTME: Re-exports command modules for cephx-keys
// ABOUTME: Provides access to key management and audit log commands

pub mod audit;
pub mod keys;
