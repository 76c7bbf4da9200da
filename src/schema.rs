//! Space and index metadata, loaded from the server's system spaces.
//!
//! Built entirely on the public `select` surface: one query against
//! `_vspace` and one against `_vindex`. Row shapes are taken loosely
//! (only id and name columns are required) so server-side format
//! additions do not break loading.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::ITER_ALL;
use crate::tuple::EmptyKey;

const VSPACE_ID: u32 = 281;
const VINDEX_ID: u32 = 289;
const SCHEMA_SELECT_LIMIT: u32 = 10_000;

/// One space's metadata.
#[derive(Debug)]
pub struct Space {
    pub id: u32,
    pub name: String,
    /// Index name to index id within this space.
    pub indexes: HashMap<String, u32>,
}

/// Snapshot of the server's space/index catalog.
#[derive(Debug, Default)]
pub struct Schema {
    by_name: HashMap<String, Arc<Space>>,
    by_id: HashMap<u32, Arc<Space>>,
}

impl Schema {
    pub(crate) async fn load(conn: &Connection) -> Result<Schema> {
        let spaces = conn
            .select(VSPACE_ID, 0, 0, SCHEMA_SELECT_LIMIT, ITER_ALL, &EmptyKey)
            .await?;
        let indexes = conn
            .select(VINDEX_ID, 0, 0, SCHEMA_SELECT_LIMIT, ITER_ALL, &EmptyKey)
            .await?;

        let schema = Schema::from_catalog(spaces.data(), indexes.data())?;
        debug!(spaces = schema.by_id.len(), "schema loaded");
        Ok(schema)
    }

    /// Build the catalog from the raw data payloads of the two system
    /// selects.
    fn from_catalog(space_rows: &[u8], index_rows: &[u8]) -> Result<Schema> {
        let mut spaces: HashMap<u32, Space> = HashMap::new();

        for row in rows(space_rows)? {
            let fields = row_fields(&row)?;
            let id = field_u32(fields, 0)?;
            let name = field_str(fields, 2)?;
            spaces.insert(
                id,
                Space {
                    id,
                    name,
                    indexes: HashMap::new(),
                },
            );
        }

        for row in rows(index_rows)? {
            let fields = row_fields(&row)?;
            let space_id = field_u32(fields, 0)?;
            let index_id = field_u32(fields, 1)?;
            let name = field_str(fields, 2)?;
            if let Some(space) = spaces.get_mut(&space_id) {
                space.indexes.insert(name, index_id);
            }
        }

        let mut schema = Schema::default();
        for (id, space) in spaces {
            let space = Arc::new(space);
            schema.by_name.insert(space.name.clone(), Arc::clone(&space));
            schema.by_id.insert(id, space);
        }
        Ok(schema)
    }

    pub fn space(&self, name: &str) -> Option<&Arc<Space>> {
        self.by_name.get(name)
    }

    pub fn space_by_id(&self, id: u32) -> Option<&Arc<Space>> {
        self.by_id.get(&id)
    }

    /// Resolve space and index names to their numeric ids.
    pub fn resolve(&self, space: &str, index: &str) -> Option<(u32, u32)> {
        let space = self.by_name.get(space)?;
        let index = space.indexes.get(index)?;
        Some((space.id, *index))
    }
}

fn rows(mut data: &[u8]) -> Result<Vec<Value>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    match rmpv::decode::read_value(&mut data)? {
        Value::Array(rows) => Ok(rows),
        other => Err(Error::Protocol(format!(
            "catalog payload is not an array: {other}"
        ))),
    }
}

fn row_fields(row: &Value) -> Result<&[Value]> {
    row.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Protocol("catalog row is not an array".into()))
}

fn field_u32(fields: &[Value], idx: usize) -> Result<u32> {
    fields
        .get(idx)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| Error::Protocol(format!("catalog field {idx} is not an integer")))
}

fn field_str(fields: &[Value], idx: usize) -> Result<String> {
    fields
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Protocol(format!("catalog field {idx} is not a string")))
}
