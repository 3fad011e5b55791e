//! Schema negotiation for creation requests.
//!
//! Two request shapes are accepted. Legacy (1.0) describes a standalone
//! VM-isolated container in a single document. Split (2.0) describes either
//! a container hosted in an existing utility VM or a new utility VM. The
//! request is classified once here; everything downstream branches on
//! [`Negotiated`].

use crate::error::{CoreError, Result};
use crate::request::{CreateRequest, HyperVSettings, OPTION_IS_UTILITY_VM, OPTION_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Creation schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// Single-document form (1.0)
    Legacy,
    /// Split utility VM / container form (2.0)
    Split,
}

impl SchemaVersion {
    /// Version tag as written in requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::Legacy => "1.0",
            SchemaVersion::Split => "2.0",
        }
    }

    /// Parse a version tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "1.0" | "1" | "v1" => Some(SchemaVersion::Legacy),
            "2.0" | "2" | "v2" => Some(SchemaVersion::Split),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of negotiation: which creation path a request takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    /// Standalone VM-isolated container
    Legacy {
        /// Hyper-V settings from the request
        hyper_v: HyperVSettings,
    },
    /// Container hosted in an existing utility VM
    Hosted {
        /// Hosting VM identity
        host: String,
    },
    /// New utility VM
    UtilityVm,
}

impl Negotiated {
    /// Schema the request resolved to.
    pub fn schema(&self) -> SchemaVersion {
        match self {
            Negotiated::Legacy { .. } => SchemaVersion::Legacy,
            Negotiated::Hosted { .. } | Negotiated::UtilityVm => SchemaVersion::Split,
        }
    }
}

/// Classify `request`, rejecting inconsistent combinations.
///
/// `id` only labels errors. Pure: nothing is allocated or mutated.
pub fn negotiate(id: &str, request: &CreateRequest) -> Result<Negotiated> {
    let mut tag = None;
    let mut marker = false;
    for (key, value) in &request.options {
        match key.as_str() {
            OPTION_SCHEMA_VERSION => {
                tag = Some(SchemaVersion::parse(value).ok_or_else(|| {
                    CoreError::config(id, format!("unknown schema version '{}'", value))
                })?);
            }
            OPTION_IS_UTILITY_VM => marker = parse_flag(id, value)?,
            other => tracing::debug!(container_id = %id, option = other, "Ignoring unrecognized option"),
        }
    }

    let host = request.hosting_system.as_deref();
    if host.is_some() && marker {
        return Err(CoreError::config(
            id,
            "a hosting system reference and the utility VM marker are mutually exclusive",
        ));
    }

    let schema = tag.unwrap_or(if host.is_some() || marker {
        SchemaVersion::Split
    } else {
        SchemaVersion::Legacy
    });
    tracing::trace!(container_id = %id, %schema, explicit = tag.is_some(), "Schema resolved");

    match schema {
        SchemaVersion::Legacy => {
            if host.is_some() || marker {
                return Err(CoreError::config(
                    id,
                    "schema 1.0 does not accept a hosting system or the utility VM marker",
                ));
            }
            match &request.hyper_v {
                Some(hyper_v) => Ok(Negotiated::Legacy {
                    hyper_v: hyper_v.clone(),
                }),
                None => Err(CoreError::config(
                    id,
                    "schema 1.0 requires a Hyper-V section; process-isolated containers are not supported",
                )),
            }
        }
        SchemaVersion::Split => {
            if request.hyper_v.is_some() {
                return Err(CoreError::config(id, "schema 2.0 does not accept a Hyper-V section"));
            }
            match host {
                Some("") => Err(CoreError::config(id, "hosting system reference is empty")),
                Some(host) => Ok(Negotiated::Hosted {
                    host: host.to_string(),
                }),
                None if marker => Ok(Negotiated::UtilityVm),
                None => Err(CoreError::config(
                    id,
                    "schema 2.0 requires a hosting system or the utility VM marker",
                )),
            }
        }
    }
}

fn parse_flag(id: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" | "" => Ok(false),
        other => Err(CoreError::config(
            id,
            format!("invalid value '{}' for option {}", other, OPTION_IS_UTILITY_VM),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy() -> CreateRequest {
        CreateRequest::new()
            .layer_folders(["/base", "/scratch"])
            .hyper_v(HyperVSettings::default())
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(SchemaVersion::parse("1.0"), Some(SchemaVersion::Legacy));
        assert_eq!(SchemaVersion::parse("V2"), Some(SchemaVersion::Split));
        assert_eq!(SchemaVersion::parse("3.0"), None);
        assert_eq!(SchemaVersion::Split.to_string(), "2.0");
    }

    #[test]
    fn test_default_is_legacy() {
        let negotiated = negotiate("c", &legacy()).unwrap();
        assert_eq!(negotiated.schema(), SchemaVersion::Legacy);
    }

    #[test]
    fn test_default_split_for_hosted() {
        let request = CreateRequest::new().hosted_in("uvm");
        assert_eq!(
            negotiate("c", &request).unwrap(),
            Negotiated::Hosted { host: "uvm".into() }
        );
    }

    #[test]
    fn test_marker_creates_utility_vm() {
        let request = CreateRequest::new().schema("2.0").utility_vm();
        assert_eq!(negotiate("u", &request).unwrap(), Negotiated::UtilityVm);

        let request = CreateRequest::new().option(OPTION_IS_UTILITY_VM, "no").hosted_in("uvm");
        assert!(matches!(negotiate("c", &request).unwrap(), Negotiated::Hosted { .. }));
    }

    #[test]
    fn test_host_and_marker_conflict() {
        let request = CreateRequest::new().hosted_in("uvm").utility_vm();
        let err = negotiate("c", &request).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { ref id, .. } if id == "c"));
    }

    #[test]
    fn test_mixed_schema_fields_rejected() {
        // Legacy tag with a split-only field
        let request = legacy().schema("1.0").hosted_in("uvm");
        assert!(negotiate("c", &request).is_err());

        // Split tag with a legacy-only field
        let request = legacy().schema("2.0").hosted_in("uvm");
        assert!(negotiate("c", &request).is_err());
    }

    #[test]
    fn test_split_without_target_rejected() {
        let request = CreateRequest::new().schema("2.0");
        assert!(negotiate("c", &request).is_err());
    }

    #[test]
    fn test_legacy_requires_hyper_v() {
        let request = CreateRequest::new().layer_folders(["/base", "/scratch"]);
        assert!(negotiate("c", &request).is_err());
    }

    #[test]
    fn test_bad_option_values() {
        assert!(negotiate("c", &legacy().schema("9")).is_err());
        assert!(negotiate("c", &CreateRequest::new().option(OPTION_IS_UTILITY_VM, "maybe")).is_err());
    }

    #[test]
    fn test_unknown_options_ignored() {
        let request = legacy().option("network_mode", "nat");
        assert!(negotiate("c", &request).is_ok());
    }
}
