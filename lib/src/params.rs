//! Per-generation storage parameters. Written as `store.json` when a
//! generation is created and copied byte-for-byte into every generation that
//! compaction derives from it.

use crate::consts::{DEFAULT_NODE_CACHE_SIZE, DEFAULT_QUAD_INDEXES, PARAMS_FILE};
use crate::errors::{Result, StoreError};
use crate::index::IndexOrder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreParams {
    /// Quad index layouts, primary first.
    #[serde(default = "default_indexes")]
    pub quad_indexes: Vec<String>,
    /// Initial capacity of the node table.
    #[serde(default = "default_node_cache_size")]
    pub node_cache_size: usize,
    /// fsync the journal on every commit.
    #[serde(default)]
    pub sync_commits: bool,
}

fn default_indexes() -> Vec<String> {
    DEFAULT_QUAD_INDEXES.iter().map(|s| s.to_string()).collect()
}

fn default_node_cache_size() -> usize {
    DEFAULT_NODE_CACHE_SIZE
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            quad_indexes: default_indexes(),
            node_cache_size: default_node_cache_size(),
            sync_commits: false,
        }
    }
}

impl StoreParams {
    pub fn with_indexes<I, S>(indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            quad_indexes: indexes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses and checks the index layouts.
    pub fn index_orders(&self) -> Result<Vec<IndexOrder>> {
        let orders = self
            .quad_indexes
            .iter()
            .map(|name| IndexOrder::parse(name))
            .collect::<Result<Vec<_>>>()?;
        if orders.is_empty() {
            return Err(StoreError::Config("no quad indexes configured".to_string()));
        }
        for (i, order) in orders.iter().enumerate() {
            if orders[..i].contains(order) {
                return Err(StoreError::Config(format!(
                    "index {order} is listed twice"
                )));
            }
        }
        Ok(orders)
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let params_str = serde_json::to_string_pretty(&self)?;
        let mut file = File::create(dir.join(PARAMS_FILE))?;
        file.write_all(params_str.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// `None` when the directory holds no parameters file.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(PARAMS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        let params: StoreParams = serde_json::from_reader(reader)?;
        params.index_orders()?;
        Ok(Some(params))
    }

    /// Copies the parameters file unchanged from one generation directory to
    /// another.
    pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
        std::fs::copy(from.join(PARAMS_FILE), to.join(PARAMS_FILE))?;
        Ok(())
    }
}
