use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::PackageError;
use crate::settings::{ProjectType, SystemVersion};

pub const MANIFEST_FILE: &str = "package.xml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
}

/// Contents of `package.xml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub version: String,
    pub hotfix: u32,
    pub project_type: Option<ProjectType>,
    pub created_at: Option<String>,
    pub files: Vec<ManifestFile>,
}

impl PackageManifest {
    pub fn new(version: impl Into<String>, hotfix: u32) -> Self {
        Self {
            version: version.into(),
            hotfix,
            project_type: None,
            created_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            files: Vec::new(),
        }
    }

    pub fn system_version(&self) -> Result<SystemVersion, PackageError> {
        SystemVersion::parse(&self.version, self.hotfix).map_err(|err| {
            PackageError::InvalidVersion {
                value: self.version.clone(),
                reason: err.to_string(),
            }
        })
    }

    pub fn load(path: &Path) -> Result<Self, PackageError> {
        let text = fs::read_to_string(path).map_err(|err| PackageError::io(path, err))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, PackageError> {
        let doc = roxmltree::Document::parse(text).map_err(|err| PackageError::Xml {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let root = doc.root_element();
        let (version, hotfix) = read_version_attributes(&root, path)?;
        let project_type = match root.attribute("projectType") {
            Some("web_application") => Some(ProjectType::WebApplication),
            Some("web_site") => Some(ProjectType::WebSite),
            _ => None,
        };
        let files = root
            .children()
            .filter(|node| node.is_element() && node.tag_name().name() == "File")
            .filter_map(|node| {
                Some(ManifestFile {
                    path: node.attribute("path")?.to_string(),
                    sha256: node.attribute("sha256")?.to_ascii_lowercase(),
                })
            })
            .collect();

        Ok(Self {
            version,
            hotfix,
            project_type,
            created_at: root.attribute("created").map(str::to_string),
            files,
        })
    }
}

/// Reads the `version`/`hotfix` attribute pair from a package root element.
pub(crate) fn read_version_attributes(
    root: &roxmltree::Node<'_, '_>,
    path: &Path,
) -> Result<(String, u32), PackageError> {
    let version = root
        .attribute("version")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PackageError::HeaderMissing(path.display().to_string()))?
        .to_string();
    let hotfix = match root.attribute("hotfix").map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw.parse().map_err(|_| PackageError::InvalidVersion {
            value: format!("{version} hotfix {raw}"),
            reason: "hotfix must be a non-negative integer".to_string(),
        })?,
    };
    Ok((version, hotfix))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
