// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Vector store adapter
//!
//! Tables of (content, vector, metadata) rows queried by nearest neighbour.
//! `LocalVectorStore` keeps every table in a bincode file under one directory
//! and searches it exhaustively by cosine distance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{Result, RuntimeError};
use crate::vector::embeddings::Embedding;

const TABLE_EXTENSION: &str = "table";
const FORMAT_VERSION: u32 = 1;

/// Row written to a vector table
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub content: String,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// Search hit, closest first
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub content: String,
    /// Cosine distance in `[0, 2]`
    pub distance: f32,
    pub metadata: Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Create a table holding `rows`; fails if it already exists
    async fn create_table(&self, name: &str, rows: Vec<VectorRow>) -> Result<Arc<dyn VectorTable>>;

    async fn open_table(&self, name: &str) -> Result<Arc<dyn VectorTable>>;

    async fn drop_table(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait VectorTable: Send + Sync {
    fn name(&self) -> &str;

    async fn add(&self, rows: Vec<VectorRow>) -> Result<()>;

    /// Up to `limit` rows ordered by ascending distance to `vector`
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>>;

    async fn count(&self) -> Result<usize>;
}

/// On-disk row; metadata is kept as JSON text since bincode cannot
/// round-trip self-describing values
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    content: String,
    vector: Vec<f32>,
    metadata: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableFile {
    version: u32,
    dimension: Option<usize>,
    rows: Vec<StoredRow>,
}

pub struct LocalVectorStore {
    dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<LocalTable>>>,
}

impl LocalVectorStore {
    /// Open the store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "Vector store opened");
        Ok(Self {
            dir,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, TABLE_EXTENSION))
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn create_table(&self, name: &str, rows: Vec<VectorRow>) -> Result<Arc<dyn VectorTable>> {
        validate_table_name(name)?;
        let mut tables = self.tables.write().await;
        let path = self.table_path(name);
        if tables.contains_key(name) || tokio::fs::try_exists(&path).await? {
            return Err(RuntimeError::VectorStore(format!(
                "Table already exists: {}",
                name
            )));
        }

        let mut data = TableFile {
            version: FORMAT_VERSION,
            ..Default::default()
        };
        append_rows(&mut data, rows)?;
        persist(&path, &data).await?;

        debug!(table = name, rows = data.rows.len(), "Vector table created");
        let table = Arc::new(LocalTable {
            name: name.to_string(),
            path,
            data: RwLock::new(data),
        });
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    async fn open_table(&self, name: &str) -> Result<Arc<dyn VectorTable>> {
        validate_table_name(name)?;
        if let Some(table) = self.tables.read().await.get(name) {
            return Ok(table.clone());
        }

        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }

        let path = self.table_path(name);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RuntimeError::VectorStore(format!(
                "Table not found: {}",
                name
            )));
        }

        let bytes = tokio::fs::read(&path).await?;
        let data: TableFile = bincode::deserialize(&bytes).map_err(|e| {
            RuntimeError::VectorStore(format!("Corrupt table file {}: {}", path.display(), e))
        })?;
        if data.version != FORMAT_VERSION {
            return Err(RuntimeError::VectorStore(format!(
                "Unsupported table format version {} in {}",
                data.version,
                path.display()
            )));
        }

        debug!(table = name, rows = data.rows.len(), "Vector table loaded");
        let table = Arc::new(LocalTable {
            name: name.to_string(),
            path,
            data: RwLock::new(data),
        });
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        validate_table_name(name)?;
        let mut tables = self.tables.write().await;
        tables.remove(name);

        let path = self.table_path(name);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RuntimeError::VectorStore(format!(
                "Table not found: {}",
                name
            )));
        }
        tokio::fs::remove_file(&path).await?;
        info!(table = name, "Vector table dropped");
        Ok(())
    }
}

struct LocalTable {
    name: String,
    path: PathBuf,
    data: RwLock<TableFile>,
}

#[async_trait]
impl VectorTable for LocalTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, rows: Vec<VectorRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut data = self.data.write().await;
        let mut updated = data.clone();
        append_rows(&mut updated, rows)?;
        persist(&self.path, &updated).await?;
        *data = updated;
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        let data = self.data.read().await;
        if data.rows.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if let Some(dimension) = data.dimension {
            if vector.len() != dimension {
                return Err(RuntimeError::VectorStore(format!(
                    "Invalid query dimensions: expected {}, got {}",
                    dimension,
                    vector.len()
                )));
            }
        }

        let query = Embedding::new(vector.to_vec());
        let mut scored: Vec<(f32, &StoredRow)> = data
            .rows
            .iter()
            .map(|row| {
                let candidate = Embedding::new(row.vector.clone());
                (query.cosine_distance(&candidate), row)
            })
            .collect();

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(distance, row)| VectorMatch {
                content: row.content.clone(),
                distance,
                metadata: serde_json::from_str(&row.metadata).unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.data.read().await.rows.len())
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::VectorStore(format!(
            "Invalid table name: {:?}",
            name
        )))
    }
}

fn append_rows(data: &mut TableFile, rows: Vec<VectorRow>) -> Result<()> {
    let mut dimension = data.dimension;

    let mut stored = Vec::with_capacity(rows.len());
    for row in rows {
        let embedding = Embedding::new(row.vector);
        if embedding.dimension() == 0 {
            return Err(RuntimeError::VectorStore("Empty vector".to_string()));
        }
        if !embedding.is_finite() {
            return Err(RuntimeError::VectorStore(
                "Invalid vector values: contains NaN or Infinity".to_string(),
            ));
        }
        match dimension {
            Some(expected) if expected != embedding.dimension() => {
                return Err(RuntimeError::VectorStore(format!(
                    "Invalid vector dimensions: expected {}, got {}",
                    expected,
                    embedding.dimension()
                )));
            }
            Some(_) => {}
            None => dimension = Some(embedding.dimension()),
        }

        let metadata = serde_json::to_string(&row.metadata)
            .map_err(|e| RuntimeError::VectorStore(format!("Invalid metadata: {}", e)))?;
        stored.push(StoredRow {
            content: row.content,
            vector: embedding.into_inner(),
            metadata,
        });
    }

    data.dimension = dimension;
    data.rows.extend(stored);
    Ok(())
}

/// Write to a sibling temp file, then rename over the table
async fn persist(path: &Path, data: &TableFile) -> Result<()> {
    let bytes = bincode::serialize(data)
        .map_err(|e| RuntimeError::VectorStore(format!("Failed to encode table: {}", e)))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
