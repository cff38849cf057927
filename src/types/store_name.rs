//! Table names
//!
//! A table lives in a distribution group and is stored once per region the
//! local node is responsible for. `TupleStoreName` identifies one such
//! store: `{group}_{table}` plus an optional region id.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleStoreName {
    group: String,
    table: String,
    region_id: Option<u64>,
}

fn check_part(part: &str, what: &str) -> Result<()> {
    if part.is_empty() || part.contains(SEPARATOR) || part.contains('/') {
        return Err(StorageError::InvalidArgument(format!(
            "invalid {} name '{}'",
            what, part
        )));
    }
    Ok(())
}

impl TupleStoreName {
    pub fn new(group: &str, table: &str) -> Result<Self> {
        check_part(group, "group")?;
        check_part(table, "table")?;
        Ok(Self {
            group: group.to_string(),
            table: table.to_string(),
            region_id: None,
        })
    }

    /// Parse `group_table` or `group_table_region`
    pub fn parse(full_name: &str) -> Result<Self> {
        let parts: Vec<&str> = full_name.split(SEPARATOR).collect();
        match parts.as_slice() {
            [group, table] => Self::new(group, table),
            [group, table, region] => {
                let region_id = region.parse::<u64>().map_err(|_| {
                    StorageError::InvalidArgument(format!("invalid region id in '{}'", full_name))
                })?;
                Ok(Self::new(group, table)?.with_region(region_id))
            }
            _ => Err(StorageError::InvalidArgument(format!(
                "invalid table name '{}'",
                full_name
            ))),
        }
    }

    pub fn with_region(&self, region_id: u64) -> Self {
        Self {
            group: self.group.clone(),
            table: self.table.clone(),
            region_id: Some(region_id),
        }
    }

    /// Same table without region information
    pub fn without_region(&self) -> Self {
        Self {
            group: self.group.clone(),
            table: self.table.clone(),
            region_id: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn region_id(&self) -> Option<u64> {
        self.region_id
    }

    /// Stores bound to a region take part in split and merge
    pub fn is_distributed(&self) -> bool {
        self.region_id.is_some()
    }

    /// `storage_dir/data/{group}/{table}[_{region}]`
    pub fn directory(&self, storage_dir: &Path) -> PathBuf {
        let leaf = match self.region_id {
            Some(region) => format!("{}{}{}", self.table, SEPARATOR, region),
            None => self.table.clone(),
        };
        storage_dir.join("data").join(&self.group).join(leaf)
    }
}

impl fmt::Display for TupleStoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.group, SEPARATOR, self.table)?;
        if let Some(region) = self.region_id {
            write!(f, "{}{}", SEPARATOR, region)?;
        }
        Ok(())
    }
}
