//! Document bundle export: an opaque archive of an operation's version snapshots.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use factorops_core::TenantId;
use factorops_factoring::{
    ActionType, FactorOperation, FactorOperationId, FactorOperationItem, FactorOperationVersion,
};

/// Which items of each version go into the bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleSelector {
    #[default]
    #[serde(rename = "all")]
    All,
    /// Company-held items being discounted.
    #[serde(rename = "source-docs-a")]
    SourceDocsA,
    /// Items already in factor custody (buyback, due-date change).
    #[serde(rename = "source-docs-b")]
    SourceDocsB,
}

impl BundleSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            BundleSelector::All => "all",
            BundleSelector::SourceDocsA => "source-docs-a",
            BundleSelector::SourceDocsB => "source-docs-b",
        }
    }

    pub fn includes(self, item: &FactorOperationItem) -> bool {
        match self {
            BundleSelector::All => true,
            BundleSelector::SourceDocsA => item.action_type == ActionType::Discount,
            BundleSelector::SourceDocsB => item.action_type != ActionType::Discount,
        }
    }
}

impl fmt::Display for BundleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BundleSelector {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(BundleSelector::All),
            "source-docs-a" => Ok(BundleSelector::SourceDocsA),
            "source-docs-b" => Ok(BundleSelector::SourceDocsB),
            other => Err(BundleError::UnknownSelector(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBundle {
    pub operation_id: FactorOperationId,
    pub selector: BundleSelector,
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("unknown bundle selector `{0}`")]
    UnknownSelector(String),
    #[error("operation {0} has no version to export")]
    NothingToExport(FactorOperationId),
    #[error("bundle encoding failed: {0}")]
    Encoding(String),
}

pub trait DocumentBundleExporter: Send + Sync {
    fn export(
        &self,
        tenant_id: TenantId,
        operation: &FactorOperation,
        selector: BundleSelector,
    ) -> Result<DocumentBundle, BundleError>;
}

#[derive(Serialize)]
struct BundleManifest<'a> {
    tenant_id: TenantId,
    operation_id: FactorOperationId,
    operation_number: u64,
    selector: BundleSelector,
    versions: Vec<VersionDocs<'a>>,
}

#[derive(Serialize)]
struct VersionDocs<'a> {
    version_id: String,
    version_number: u32,
    source_status: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
    items: Vec<&'a FactorOperationItem>,
}

impl<'a> VersionDocs<'a> {
    fn of(version: &'a FactorOperationVersion, selector: BundleSelector) -> Self {
        Self {
            version_id: version.id.to_string(),
            version_number: version.version_number,
            source_status: version.source_status.as_str(),
            created_at: version.created_at,
            items: version.items.iter().filter(|i| selector.includes(i)).collect(),
        }
    }
}

/// Writes every version snapshot, filtered by selector, as one JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBundleExporter;

impl DocumentBundleExporter for JsonBundleExporter {
    fn export(
        &self,
        tenant_id: TenantId,
        operation: &FactorOperation,
        selector: BundleSelector,
    ) -> Result<DocumentBundle, BundleError> {
        let operation_id = operation.id_typed();
        if operation.versions().is_empty() {
            return Err(BundleError::NothingToExport(operation_id));
        }

        let manifest = BundleManifest {
            tenant_id,
            operation_id,
            operation_number: operation.number(),
            selector,
            versions: operation
                .versions()
                .iter()
                .map(|v| VersionDocs::of(v, selector))
                .collect(),
        };
        let bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| BundleError::Encoding(e.to_string()))?;

        Ok(DocumentBundle {
            operation_id,
            selector,
            file_name: format!("operation-{}-{}.json", operation.number(), selector),
            content_type: "application/json",
            bytes,
        })
    }
}
