// ABOUTME: Scope-based permission model for API keys (resource:action with wildcards)
// ABOUTME: Parses scopes once into a tagged structure and evaluates grants fail-closed
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Permission Model
//!
//! A [`Scope`] is a `resource:action` pair where either position may be the
//! wildcard `*`. Scopes are parsed once into [`ScopePart`] values so matching
//! never re-splits strings.
//!
//! Matching a granted scope `G` against a required scope `R`:
//!
//! - `admin:*` is the superuser scope and satisfies every required scope.
//!   This is an explicit policy, not a side effect of wildcard matching.
//! - Otherwise each position of `G` matches when it is `*` or equals the same
//!   position of `R`.
//!
//! Required scopes must be concrete and drawn from the catalog in
//! [`crate::constants::permissions`]. A required scope that is malformed,
//! contains a wildcard, or names an unknown resource or action is denied for
//! every key, including superusers. An empty [`PermissionSet`] denies
//! everything.

use crate::constants::permissions::{ACTIONS, ADMIN_ALL, RESOURCES, SEPARATOR, WILDCARD};
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// One position of a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopePart {
    /// `*`
    Any,
    /// A concrete resource or action name
    Named(String),
}

impl ScopePart {
    fn parse(segment: &str) -> Option<Self> {
        if segment == WILDCARD {
            return Some(Self::Any);
        }
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        valid.then(|| Self::Named(segment.to_owned()))
    }

    fn matches(&self, required: &Self) -> bool {
        match (self, required) {
            (Self::Any, _) => true,
            (Self::Named(granted), Self::Named(required)) => granted == required,
            (Self::Named(_), Self::Any) => false,
        }
    }

    fn is_in(&self, catalog: &[&str]) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => catalog.contains(&name.as_str()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Any => WILDCARD,
            Self::Named(name) => name,
        }
    }
}

/// A parsed `resource:action` scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    resource: ScopePart,
    action: ScopePart,
}

impl Scope {
    /// Build a concrete scope
    #[must_use]
    pub fn new(resource: &str, action: &str) -> Self {
        Self {
            resource: ScopePart::Named(resource.to_owned()),
            action: ScopePart::Named(action.to_owned()),
        }
    }

    /// The superuser scope `admin:*`
    #[must_use]
    pub fn superuser() -> Self {
        Self {
            resource: ScopePart::Named("admin".to_owned()),
            action: ScopePart::Any,
        }
    }

    /// Resource position
    #[must_use]
    pub const fn resource(&self) -> &ScopePart {
        &self.resource
    }

    /// Action position
    #[must_use]
    pub const fn action(&self) -> &ScopePart {
        &self.action
    }

    /// Whether this is `admin:*`
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        matches!(&self.resource, ScopePart::Named(r) if r == "admin") && self.action == ScopePart::Any
    }

    /// Whether neither position is a wildcard
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        matches!(
            (&self.resource, &self.action),
            (ScopePart::Named(_), ScopePart::Named(_))
        )
    }

    /// Whether this scope may be granted to a key
    #[must_use]
    pub fn is_grantable(&self) -> bool {
        self.is_superuser() || (self.resource.is_in(RESOURCES) && self.action.is_in(ACTIONS))
    }

    /// Parse a scope that a request requires
    ///
    /// Returns `None` for anything that is not a concrete catalog scope.
    #[must_use]
    pub fn parse_required(s: &str) -> Option<Self> {
        let scope: Self = s.parse().ok()?;
        (scope.is_concrete() && scope.resource.is_in(RESOURCES) && scope.action.is_in(ACTIONS))
            .then_some(scope)
    }

    /// Does this granted scope satisfy `required`
    #[must_use]
    pub fn grants(&self, required: &Self) -> bool {
        if self.is_superuser() {
            return true;
        }
        self.resource.matches(&required.resource) && self.action.matches(&required.action)
    }
}

impl FromStr for Scope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (resource, action) = trimmed
            .split_once(SEPARATOR)
            .ok_or_else(|| AppError::invalid_permission(s))?;
        if action.contains(SEPARATOR) {
            return Err(AppError::invalid_permission(s));
        }
        match (ScopePart::parse(resource), ScopePart::parse(action)) {
            (Some(resource), Some(action)) => Ok(Self { resource, action }),
            _ => Err(AppError::invalid_permission(s)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}",
            self.resource.as_str(),
            self.action.as_str()
        )
    }
}

/// The scopes granted to one key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PermissionSet {
    scopes: Vec<Scope>,
}

impl PermissionSet {
    /// Parse and validate operator-supplied permissions against the catalog
    ///
    /// # Errors
    ///
    /// Returns `InvalidPermission` for the first malformed or non-grantable entry.
    pub fn parse<I, S>(permissions: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scopes = Vec::new();
        for raw in permissions {
            let raw = raw.as_ref();
            let scope: Scope = raw.parse()?;
            if !scope.is_grantable() {
                return Err(AppError::invalid_permission(raw));
            }
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        Ok(Self { scopes })
    }

    /// Rebuild from stored strings, dropping entries that no longer parse
    #[must_use]
    pub fn from_stored(permissions: Vec<String>) -> Self {
        let mut scopes = Vec::with_capacity(permissions.len());
        for raw in permissions {
            match raw.parse::<Scope>() {
                Ok(scope) if scope.is_grantable() => {
                    if !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
                _ => warn!(permission = %raw, "Ignoring unrecognized stored permission"),
            }
        }
        Self { scopes }
    }

    /// Decode the JSON array stored in the database
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the column is not a JSON array of strings
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let permission_strings: Vec<String> = serde_json::from_str(json)?;
        Ok(Self::from_stored(permission_strings))
    }

    /// Encode as a JSON array for database storage
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_strings())
    }

    /// Is the key allowed to perform `required_scope`
    ///
    /// Unknown or malformed required scopes are denied.
    #[must_use]
    pub fn allows(&self, required_scope: &str) -> bool {
        Scope::parse_required(required_scope).is_some_and(|required| self.allows_scope(&required))
    }

    /// Is the key allowed to perform an already-parsed required scope
    #[must_use]
    pub fn allows_scope(&self, required: &Scope) -> bool {
        self.scopes.iter().any(|granted| granted.grants(required))
    }

    /// Whether any granted scope is `admin:*`
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.scopes.iter().any(Scope::is_superuser)
    }

    /// Granted scopes in grant order
    #[must_use]
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// No scopes granted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Scopes rendered as strings
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.scopes.iter().map(ToString::to_string).collect()
    }
}

impl TryFrom<Vec<String>> for PermissionSet {
    type Error = AppError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PermissionSet> for Vec<String> {
    fn from(value: PermissionSet) -> Self {
        value.to_strings()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strings().join(","))
    }
}

/// Every grantable scope string, for help output
#[must_use]
pub fn catalog() -> Vec<String> {
    let mut all: Vec<String> = RESOURCES
        .iter()
        .flat_map(|resource| ACTIONS.iter().map(move |action| format!("{resource}:{action}")))
        .collect();
    all.push(ADMIN_ALL.to_owned());
    all
}
