//! Compute warehouses a statement may target.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: u64,
    pub name: String,
}

/// How a session selected its warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseRef {
    Id(u64),
    Name(String),
}

pub trait WarehouseCatalog: Send + Sync + 'static {
    fn by_id(&self, id: u64) -> Option<Warehouse>;
    fn by_name(&self, name: &str) -> Option<Warehouse>;

    fn resolve(&self, selected: &WarehouseRef) -> Result<Warehouse> {
        match selected {
            WarehouseRef::Id(id) => self
                .by_id(*id)
                .ok_or_else(|| MetaError::UnknownWarehouse(id.to_string())),
            WarehouseRef::Name(name) => self
                .by_name(name)
                .ok_or_else(|| MetaError::UnknownWarehouse(name.clone())),
        }
    }
}

/// Fixed warehouse list, loaded once.
#[derive(Debug, Clone, Default)]
pub struct StaticWarehouses {
    by_id: HashMap<u64, Warehouse>,
}

impl StaticWarehouses {
    pub fn new(warehouses: impl IntoIterator<Item = Warehouse>) -> Self {
        Self {
            by_id: warehouses.into_iter().map(|w| (w.id, w)).collect(),
        }
    }
}

impl WarehouseCatalog for StaticWarehouses {
    fn by_id(&self, id: u64) -> Option<Warehouse> {
        self.by_id.get(&id).cloned()
    }

    fn by_name(&self, name: &str) -> Option<Warehouse> {
        self.by_id.values().find(|w| w.name == name).cloned()
    }
}
