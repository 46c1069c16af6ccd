//! File identifier scheme: `<namespace>/<uuid>` or a bare UUID.

use uuid::Uuid;

/// Namespace prefix of file identifiers.
pub const DEFAULT_NAMESPACE: &str = "dg.4DFC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdScheme {
    pub namespace: String,
    /// Identifiers are written without the namespace prefix.
    pub omit_namespace: bool,
}

impl Default for IdScheme {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            omit_namespace: false,
        }
    }
}

impl IdScheme {
    /// Checks the structure of a manifest-supplied identifier.
    pub fn validate(&self, id: &str) -> Result<Uuid, String> {
        let uuid_part = if self.omit_namespace {
            id
        } else {
            match id.split_once('/') {
                Some((ns, rest)) if ns == self.namespace => rest,
                Some((ns, _)) => {
                    return Err(format!(
                        "identifier \"{}\" has namespace \"{}\", expected \"{}\"",
                        id, ns, self.namespace
                    ))
                }
                None => {
                    return Err(format!(
                        "identifier \"{}\" is missing the \"{}/\" prefix",
                        id, self.namespace
                    ))
                }
            }
        };
        Uuid::parse_str(uuid_part)
            .map_err(|e| format!("identifier \"{}\" is not a valid UUID: {}", id, e))
    }

    /// Identifier as written to the final manifest.
    pub fn present(&self, id: &str) -> String {
        if self.omit_namespace {
            let prefix = format!("{}/", self.namespace);
            id.strip_prefix(&prefix).unwrap_or(id).to_string()
        } else {
            id.to_string()
        }
    }
}
