//! Extension manifest parsing and validation.
//!
//! Parses `extension.toml` files that declare extension metadata and
//! outbound HTTP permissions.

use serde::{Deserialize, Serialize};

use crate::descriptor::{ExtensionDescriptor, ExtensionType, Language};
use crate::error::ExtensionError;

/// File name looked up in every extension directory.
pub const MANIFEST_FILE: &str = "extension.toml";

/// Extension manifest parsed from `extension.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub extension: ExtensionMeta,
    #[serde(default)]
    pub permissions: Permissions,
}

/// `[extension]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub extension_type: ExtensionType,
    #[serde(default)]
    pub language: Language,
    pub entry: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub manifest_uri: Option<String>,
}

/// Declared capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Hosts reachable through `http::get`/`http::post`. Exact names,
    /// `*.suffix` globs, or `*` for any public host.
    #[serde(default)]
    pub http_hosts: Vec<String>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate an extension id against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_extension_id(id: &str) -> Result<(), ExtensionError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension id must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension id contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), ExtensionError> {
    semver::Version::parse(value).map_err(|_| {
        ExtensionError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

fn validate_length(
    value: &str,
    field_name: &str,
    max: usize,
) -> Result<(), ExtensionError> {
    let len = value.len();
    if len == 0 || len > max {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must be 1-{max} characters, got {len}"
        )));
    }
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ExtensionError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(ExtensionError::InvalidManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

/// Validate an HTTP host entry.
///
/// Must be non-empty, contain no spaces, and either be `"*"`, `"localhost"`,
/// or contain at least one dot.
fn validate_http_host(host: &str) -> Result<(), ExtensionError> {
    if host.is_empty() {
        return Err(ExtensionError::InvalidManifest(
            "http_hosts entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(ExtensionError::InvalidManifest(format!(
            "http_hosts entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(ExtensionError::InvalidManifest(format!(
            "http_hosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

fn validate_manifest_uri(uri: &str) -> Result<(), ExtensionError> {
    let parsed = url::Url::parse(uri).map_err(|e| {
        ExtensionError::InvalidManifest(format!("extension.manifest_uri is not a URL: {e}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension.manifest_uri must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    Ok(())
}

impl ExtensionManifest {
    /// Parse an extension manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest: ExtensionManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        let meta = &self.extension;

        validate_extension_id(&meta.id)?;
        validate_length(&meta.name, "extension.name", 100)?;
        validate_semver(&meta.version, "extension.version")?;

        if let Some(ref description) = meta.description {
            validate_length(description, "extension.description", 500)?;
        }
        if let Some(ref author) = meta.author {
            validate_length(author, "extension.author", 255)?;
        }
        if let Some(ref uri) = meta.manifest_uri {
            validate_manifest_uri(uri)?;
        }

        validate_path_safety(&meta.entry, "extension.entry")?;
        if !meta.entry.ends_with(".rhai") {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension.entry must end with '.rhai', got '{}'",
                meta.entry
            )));
        }

        for host in &self.permissions.http_hosts {
            validate_http_host(host)?;
        }
        if meta.extension_type.is_plugin() && !self.permissions.http_hosts.is_empty() {
            tracing::warn!(
                extension = %meta.id,
                "http_hosts declared by a plugin are ignored; only providers get http access"
            );
        }

        Ok(())
    }

    /// Parse and validate an extension manifest from a TOML string.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Build a descriptor from this manifest and the entry file's source.
    pub fn into_descriptor(self, payload: String) -> ExtensionDescriptor {
        let meta = self.extension;
        ExtensionDescriptor {
            id: meta.id,
            name: meta.name,
            version: meta.version,
            extension_type: meta.extension_type,
            language: meta.language,
            payload,
            manifest_uri: meta.manifest_uri,
            author: meta.author,
            description: meta.description,
            permissions: self.permissions,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
