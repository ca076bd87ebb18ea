use crate::TransferError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const CHANGE_SUMMARY_OPERATION: &str = "NuxeoDrive.GetChangeSummary";
/// Operations in this namespace come from the server addon.
pub const ADDON_NAMESPACE: &str = "NuxeoDrive.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamDescriptor>,
}

impl OperationDescriptor {
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.params.iter().filter(|p| p.required).map(|p| p.name.as_str())
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct AutomationDocument {
    operations: Vec<OperationDescriptor>,
}

/// Operations the server registered, addressable by id or alias.
#[derive(Debug, Clone)]
pub struct OperationCatalog {
    server: String,
    client_version: String,
    operations: HashMap<String, Arc<OperationDescriptor>>,
}

impl OperationCatalog {
    pub fn empty(server: &str, client_version: &str) -> Self {
        Self {
            server: server.to_string(),
            client_version: client_version.to_string(),
            operations: HashMap::new(),
        }
    }

    /// Builds the catalog from the automation root document.
    pub fn from_document(
        document: serde_json::Value,
        server: &str,
        client_version: &str,
    ) -> Result<Self, TransferError> {
        let doc: AutomationDocument = serde_json::from_value(document)
            .map_err(|e| TransferError::BadResponse(format!("operation catalog: {e}")))?;
        let mut catalog = Self::empty(server, client_version);
        for op in doc.operations {
            let op = Arc::new(op);
            for alias in &op.aliases {
                catalog.operations.insert(alias.clone(), op.clone());
            }
            catalog.operations.insert(op.id.clone(), op);
        }
        Ok(catalog)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name).map(|op| op.as_ref())
    }

    /// Number of names, aliases included.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn check_operation(&self, name: &str) -> Result<&OperationDescriptor, TransferError> {
        match self.get(name) {
            Some(op) => Ok(op),
            None if name.starts_with(ADDON_NAMESPACE) => Err(TransferError::AddonNotInstalled {
                server: self.server.clone(),
                client_version: self.client_version.clone(),
                operation: name.to_string(),
            }),
            None => Err(TransferError::UnknownOperation(name.to_string())),
        }
    }

    /// Fails on the first missing required param; unexpected names are
    /// only logged.
    pub fn check_params(
        &self,
        name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), TransferError> {
        let op = self.check_operation(name)?;
        for key in params.keys() {
            if !op.accepts(key) {
                tracing::trace!(operation = name, param = %key, "unexpected param");
            }
        }
        if let Some(missing) = op.required().find(|p| !params.contains_key(*p)) {
            return Err(TransferError::MissingParam {
                operation: name.to_string(),
                param: missing.to_string(),
            });
        }
        Ok(())
    }

    /// Whether change summaries page by event log id instead of by date.
    pub fn is_event_log_id(&self) -> bool {
        self.get(CHANGE_SUMMARY_OPERATION)
            .map(|op| op.accepts("lowerBound"))
            .unwrap_or(false)
    }
}
