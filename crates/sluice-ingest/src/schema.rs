//! Schema registry: compiles a directory tree of JSON Schemas (draft 2020-12)
//! keyed by object type, and opens one queue per key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::queue::{QueueOptions, QueueSet};

/// Most validation messages reported for one object.
const MAX_REPORTED_ERRORS: usize = 8;

/// A compiled schema for one object type.
pub struct Schema {
    key: String,
    path: PathBuf,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Schema {
    /// Compile a schema document. The key is its `title`, falling back to
    /// the file stem.
    pub fn compile(path: &Path, document: &Value) -> Result<Self> {
        let key = schema_key(path, document)?;
        let validator = jsonschema::draft202012::new(document).map_err(|e| Error::SchemaCompile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            key,
            path: path.to_path_buf(),
            validator,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }

    /// Validate an instance, collecting the first few error messages.
    pub fn validate(&self, instance: &Value) -> Result<()> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                object: self.key.clone(),
                errors,
            })
        }
    }
}

fn schema_key(path: &Path, document: &Value) -> Result<String> {
    let title = document
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty());

    let key = match title {
        Some(title) => title.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    // The key names a queue directory.
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(Error::SchemaCompile {
            path: path.to_path_buf(),
            reason: format!("'{key}' is not usable as an object type name"),
        });
    }
    Ok(key)
}

/// Every compiled schema, by object type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Compile every `*.json` file under `dir`, recursively.
    ///
    /// Files are visited in sorted path order; a key defined twice fails on
    /// the later file.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::SchemaCompile {
                path: dir.to_path_buf(),
                reason: "schema directory does not exist".to_string(),
            });
        }

        let mut files = Vec::new();
        collect_json_files(dir, &mut files)?;
        files.sort();

        let mut registry = Self::default();
        for path in files {
            let raw = fs::read_to_string(&path).map_err(|e| Error::SchemaCompile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let document: Value = serde_json::from_str(&raw).map_err(|e| Error::SchemaCompile {
                path: path.clone(),
                reason: format!("invalid JSON: {e}"),
            })?;
            registry.insert(Schema::compile(&path, &document)?)?;
        }

        info!(
            dir = %dir.display(),
            schemas = registry.len(),
            "schemas loaded"
        );
        Ok(registry)
    }

    /// Add a compiled schema; duplicate keys are rejected.
    pub fn insert(&mut self, schema: Schema) -> Result<()> {
        if let Some(existing) = self.schemas.get(schema.key()) {
            return Err(Error::SchemaCompile {
                path: schema.path.clone(),
                reason: format!(
                    "duplicate schema key '{}' (already defined by {})",
                    schema.key,
                    existing.path.display()
                ),
            });
        }
        debug!(key = %schema.key, path = %schema.path.display(), "compiled schema");
        self.schemas.insert(schema.key.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Open one queue per schema key under `queue_dir`.
    pub fn open_queues(&self, queue_dir: &Path, options: QueueOptions) -> Result<QueueSet> {
        self.open_queues_with(queue_dir, options, &BTreeMap::new())
    }

    /// Open one queue per schema key, read by the consumers listed for that
    /// key in `consumers`.
    pub fn open_queues_with(
        &self,
        queue_dir: &Path,
        options: QueueOptions,
        consumers: &BTreeMap<String, Vec<String>>,
    ) -> Result<QueueSet> {
        fs::create_dir_all(queue_dir).map_err(|source| Error::QueueSetup {
            path: queue_dir.to_path_buf(),
            source,
        })?;
        Ok(QueueSet::open_with_consumers(
            queue_dir,
            self.keys(),
            options,
            consumers,
        )?)
    }
}

/// Load the schema registry and open its queues.
pub fn load(
    schemas_dir: &Path,
    queue_dir: &Path,
    options: QueueOptions,
) -> Result<(SchemaRegistry, QueueSet)> {
    let registry = SchemaRegistry::load_dir(schemas_dir)?;
    let queues = registry.open_queues(queue_dir, options)?;
    Ok((registry, queues))
}

fn walk_error(dir: &Path, e: std::io::Error) -> Error {
    Error::SchemaCompile {
        path: dir.to_path_buf(),
        reason: format!("cannot list directory: {e}"),
    }
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| walk_error(dir, e))?;

    for entry in entries {
        let path = entry.map_err(|e| walk_error(dir, e))?.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}
