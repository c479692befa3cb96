// ABOUTME: Unit tests for the scope-based permission model
// ABOUTME: Tests scope parsing, wildcard grants, superuser policy and serde validation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![allow(clippy::unwrap_used, missing_docs)]

use cephx_api_auth::errors::ErrorCode;
use cephx_api_auth::permissions::{catalog, PermissionSet, Scope, ScopePart};

#[test]
fn test_scope_parsing() {
    let scope: Scope = "fs:read".parse().unwrap();
    assert_eq!(scope.resource(), &ScopePart::Named("fs".to_owned()));
    assert_eq!(scope.action(), &ScopePart::Named("read".to_owned()));
    assert!(scope.is_concrete());

    let wildcard: Scope = " snapshot:* ".parse().unwrap();
    assert_eq!(wildcard.action(), &ScopePart::Any);
    assert_eq!(wildcard.to_string(), "snapshot:*");
    assert!(!wildcard.is_concrete());

    for malformed in ["fs", "fs:", ":read", "fs:read:extra", "FS:READ", "fs read"] {
        let err = malformed.parse::<Scope>().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPermission, "{malformed}");
    }
}

#[test]
fn test_superuser_is_explicit_policy() {
    let admin = PermissionSet::parse(["admin:*"]).unwrap();
    assert!(admin.is_superuser());
    for scope in catalog().iter().filter(|s| s.as_str() != "admin:*") {
        assert!(admin.allows(scope), "admin:* should allow {scope}");
    }

    // a resource wildcard on some other resource is not a superuser
    let fs_all = PermissionSet::parse(["fs:*"]).unwrap();
    assert!(!fs_all.is_superuser());
    assert!(fs_all.allows("fs:write"));
    assert!(!fs_all.allows("osd:read"));
}

#[test]
fn test_action_wildcard_spans_resources() {
    let readers = PermissionSet::parse(["*:read"]).unwrap();
    for resource in ["auth", "fs", "snapshot", "cluster", "osd", "pool"] {
        assert!(readers.allows(&format!("{resource}:read")));
        assert!(!readers.allows(&format!("{resource}:write")));
    }
}

#[test]
fn test_required_scopes_fail_closed() {
    let admin = PermissionSet::parse(["admin:*"]).unwrap();
    for required in ["pool:delete", "rgw:read", "fs:*", "*:*", "garbage", ""] {
        assert!(!admin.allows(required), "{required} must be denied");
    }
    assert!(Scope::parse_required("cluster:read").is_some());
    assert!(Scope::parse_required("cluster:*").is_none());
}

#[test]
fn test_grant_is_not_commutative() {
    let wildcard: Scope = "fs:*".parse().unwrap();
    let concrete = Scope::new("fs", "read");
    assert!(wildcard.grants(&concrete));
    assert!(!concrete.grants(&wildcard));
}

#[test]
fn test_parse_rejects_scopes_outside_catalog() {
    assert!(PermissionSet::parse(["fs:read", "pool:write"]).is_ok());
    assert_eq!(
        PermissionSet::parse(["fs:read", "pool:delete"])
            .unwrap_err()
            .code,
        ErrorCode::InvalidPermission
    );
    assert!(PermissionSet::parse(["rgw:*"]).is_err());
    assert!(PermissionSet::parse(["admin:read"]).is_err());
}

#[test]
fn test_empty_set_denies_everything() {
    let empty = PermissionSet::parse(Vec::<String>::new()).unwrap();
    assert!(empty.is_empty());
    assert!(catalog().iter().all(|scope| !empty.allows(scope)));
}

#[test]
fn test_serde_validates_on_deserialize() {
    let set: PermissionSet = serde_json::from_str(r#"["osd:read","osd:read","pool:*"]"#).unwrap();
    assert_eq!(set.to_strings(), vec!["osd:read", "pool:*"]);
    assert_eq!(serde_json::to_string(&set).unwrap(), r#"["osd:read","pool:*"]"#);
    assert_eq!(set.to_string(), "osd:read,pool:*");

    assert!(serde_json::from_str::<PermissionSet>(r#"["osd:destroy"]"#).is_err());
}

#[test]
fn test_catalog_lists_every_concrete_scope_and_superuser() {
    let all = catalog();
    assert_eq!(all.len(), 6 * 2 + 1);
    assert!(all.contains(&"auth:write".to_owned()));
    assert_eq!(all.last().map(String::as_str), Some("admin:*"));
    assert!(all.iter().all(|s| PermissionSet::parse([s]).is_ok()));
}
