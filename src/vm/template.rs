//! VM templates.
//!
//! A template is a partial [`VmParams`] stored as `<dir>/<name>.json`.
//! Applying one fills only the fields the caller left unset.

use crate::error::{Error, Result};
use crate::vm::params::VmParams;
use std::collections::HashMap;
use std::path::Path;

/// Read access to named VM templates.
pub trait TemplateCatalog: Send + Sync {
    /// Template by name.
    fn get(&self, name: &str) -> Result<VmParams>;

    /// Names of all templates, sorted.
    fn list(&self) -> Vec<String>;

    /// Fill unset fields of `params` from the named template.
    fn apply(&self, name: &str, params: &mut VmParams) -> Result<()> {
        let template = self.get(name)?;
        merge(&template, params);
        Ok(())
    }
}

/// Templates loaded once from a directory of JSON files.
#[derive(Debug, Default, Clone)]
pub struct FileTemplateCatalog {
    templates: HashMap<String, VmParams>,
}

impl FileTemplateCatalog {
    /// Load every `*.json` file in `dir`.
    ///
    /// A missing directory yields an empty catalog. Files that fail to parse
    /// are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "template directory does not exist");
            return Ok(Self { templates });
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|data| {
                    serde_json::from_str::<VmParams>(&data)
                        .map_err(|e| Error::Template(format!("{}: {}", path.display(), e)))
                });
            match parsed {
                Ok(template) => {
                    tracing::debug!(template = name, "loaded vm template");
                    templates.insert(name.to_string(), template);
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping vm template");
                }
            }
        }

        tracing::info!(count = templates.len(), "loaded vm templates");
        Ok(Self { templates })
    }

    /// Catalog from in-memory templates.
    pub fn from_templates(templates: HashMap<String, VmParams>) -> Self {
        Self { templates }
    }
}

impl TemplateCatalog for FileTemplateCatalog {
    fn get(&self, name: &str) -> Result<VmParams> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Template(format!("template not found: {}", name)))
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

fn merge(template: &VmParams, params: &mut VmParams) {
    if params.cpu.count == 0 {
        params.cpu = template.cpu.clone();
    }
    if params.memory.size_bytes == 0 {
        params.memory = template.memory.clone();
    }
    if params.disk.size_bytes == 0 && params.disk.source_image.is_none() {
        params.disk = template.disk.clone();
    } else if params.disk.format.is_none() {
        params.disk.format = template.disk.format;
    }
    if params.network.kind.is_none() {
        params.network = template.network.clone();
    }
    if params.cloud_init.user_data.is_empty() {
        let keys = std::mem::take(&mut params.cloud_init.ssh_keys);
        params.cloud_init = template.cloud_init.clone();
        if !keys.is_empty() {
            params.cloud_init.ssh_keys = keys;
        }
    }
    if params.description.is_empty() {
        params.description = template.description.clone();
    }
}
