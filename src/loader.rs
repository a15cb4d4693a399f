// src/loader.rs

//! Loading dag definitions from a directory.
//!
//! One dag per `.yaml`/`.yml` file; the file name stem becomes the dag id
//! when the `id` field is empty. Existing dags are updated in place so a
//! restart picks up edited definitions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::entity::Dag;
use crate::errors::{FlowError, Result};
use crate::store::Store;

/// Load every dag definition in `dir` into the store. Returns how many
/// dags were loaded. Files with other extensions are ignored.
pub fn read_dag_from_dir(store: &dyn Store, dir: impl AsRef<Path>) -> Result<usize> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading dag directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in &paths {
        load_dag_file(store, path)?;
    }
    info!(dir = %dir.display(), count = paths.len(), "dag definitions loaded");
    Ok(paths.len())
}

fn load_dag_file(store: &dyn Store, path: &Path) -> Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading dag file {}", path.display()))?;
    let mut dag: Dag = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing dag file {}", path.display()))?;

    if dag.id.is_empty() {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        dag.id = stem.to_string();
    }

    ensure_dag_latest(store, dag)
}

fn ensure_dag_latest(store: &dyn Store, mut dag: Dag) -> Result<()> {
    match store.get_dag(&dag.id) {
        Ok(_) => store.update_dag(&dag),
        Err(FlowError::NotFound(_)) => store.create_dag(&mut dag),
        Err(err) => Err(err),
    }
}
