/*!
SPDX SBOM sidecars.

Every successful build writes one SPDX 2.3 JSON document into the installed
tree describing the package, the checksums of its installed files, and its
dependency relationships. The document rides along inside the binary
artifact; consumers that do not care can ignore it, and its absence is never
an error on restore.
*/

use crate::abi::sha256_file;
use crate::resolver::InstallPlanAction;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to checksum {}: {source}", path.display()))]
    FileChecksum {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to walk installed tree {}: {source}", path.display()))]
    TreeWalk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Unable to write SBOM {}: {source}", path.display()))]
    SbomWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to serialize SBOM: {source}"))]
    SbomSerialize { source: serde_json::Error },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxDocument {
    spdx_version: String,
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    data_license: String,
    name: String,
    document_namespace: String,
    packages: Vec<SpdxPackage>,
    files: Vec<SpdxFile>,
    relationships: Vec<SpdxRelationship>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxPackage {
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    name: String,
    version_info: String,
    download_location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxFile {
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    file_name: String,
    checksums: Vec<SpdxChecksum>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxChecksum {
    algorithm: String,
    checksum_value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpdxRelationship {
    spdx_element_id: String,
    relationship_type: String,
    related_spdx_element: String,
}

/// Where the SBOM lives inside an installed tree.
pub(crate) fn sbom_path(installed_tree: &Path, port_name: &str) -> PathBuf {
    installed_tree
        .join("share")
        .join(port_name)
        .join("sbom.spdx.json")
}

/// Write the SBOM for a freshly built action into its installed tree.
pub(crate) fn write_sbom(action: &InstallPlanAction, installed_tree: &Path) -> Result<PathBuf> {
    let abi = action
        .abi
        .as_ref()
        .map(|abi| abi.package_abi.clone())
        .unwrap_or_default();

    let mut files = Vec::new();
    for entry in WalkDir::new(installed_tree).follow_links(false) {
        let entry = entry.context(TreeWalkSnafu {
            path: installed_tree,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(installed_tree)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(SpdxFile {
            spdx_id: format!("SPDXRef-File-{}", files.len()),
            file_name: format!("./{relative}"),
            checksums: vec![SpdxChecksum {
                algorithm: "SHA256".to_string(),
                checksum_value: sha256_file(entry.path()).context(FileChecksumSnafu {
                    path: entry.path(),
                })?,
            }],
        });
    }

    let package_id = "SPDXRef-Package".to_string();
    let relationships = action
        .dependency_specs()
        .into_iter()
        .map(|dependency| SpdxRelationship {
            spdx_element_id: package_id.clone(),
            relationship_type: "DEPENDS_ON".to_string(),
            related_spdx_element: format!("SPDXRef-Port-{}", dependency.name),
        })
        .collect();

    let document = SpdxDocument {
        spdx_version: "SPDX-2.3".to_string(),
        spdx_id: "SPDXRef-DOCUMENT".to_string(),
        data_license: "CC0-1.0".to_string(),
        name: format!("{}@{}", action.spec, action.version()),
        document_namespace: format!(
            "https://spdx.org/spdxdocs/{}-{}-{}",
            action.spec.name, action.spec.triplet, abi
        ),
        packages: vec![SpdxPackage {
            spdx_id: package_id,
            name: action.spec.name.clone(),
            version_info: action.version().to_string(),
            download_location: "NOASSERTION".to_string(),
            comment: (!abi.is_empty()).then(|| format!("ABI {abi}")),
        }],
        files,
        relationships,
    };

    let path = sbom_path(installed_tree, &action.spec.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(SbomWriteSnafu { path: &path })?;
    }
    let rendered = serde_json::to_string_pretty(&document).context(SbomSerializeSnafu)?;
    std::fs::write(&path, rendered).context(SbomWriteSnafu { path: &path })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{LoadedPort, PortManifest};
    use crate::resolver::RequestType;
    use crate::spec::{FeatureSpec, PackageSpec, Triplet};
    use std::collections::BTreeMap;

    #[test]
    fn writes_a_document_with_checksums_and_relationships() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tree.path().join("lib")).unwrap();
        std::fs::write(tree.path().join("lib/libz.a"), "bits").unwrap();

        let manifest = PortManifest::from_toml("name = \"zlib\"\nversion = \"1.0\"\n").unwrap();
        let mut feature_dependencies = BTreeMap::new();
        feature_dependencies.insert(
            "core".to_string(),
            vec![FeatureSpec::core(PackageSpec::new(
                "bzip2",
                Triplet::from("x64-linux"),
            ))],
        );
        let action = InstallPlanAction {
            spec: PackageSpec::new("zlib", Triplet::from("x64-linux")),
            port: LoadedPort::new(manifest, tree.path().to_path_buf()),
            request_type: RequestType::User,
            feature_dependencies,
            abi: None,
        };

        let path = write_sbom(&action, tree.path()).unwrap();
        assert!(path.ends_with("share/zlib/sbom.spdx.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        let document: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["spdxVersion"], "SPDX-2.3");
        assert_eq!(document["packages"][0]["name"], "zlib");
        assert_eq!(
            document["relationships"][0]["relationshipType"],
            "DEPENDS_ON"
        );
        let files = document["files"].as_array().unwrap();
        assert!(files
            .iter()
            .any(|f| f["fileName"] == "./lib/libz.a"));
    }
}
