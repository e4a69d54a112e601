//! Inventory snapshot boundary.
//!
//! In production this fronts an external inventory system; the static
//! provider carries a fixed stock list for development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::EngineError;

/// Point-in-time view of deployable stock, keyed by resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub taken_at: DateTime<Utc>,
    pub stock: BTreeMap<String, u32>,
}

/// Inventory data source boundary.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn snapshot(&self) -> Result<InventorySnapshot, EngineError>;
}

/// Fixed stock list for development and testing.
pub struct StaticInventoryProvider {
    stock: BTreeMap<String, u32>,
}

impl StaticInventoryProvider {
    pub fn with_stock(stock: BTreeMap<String, u32>) -> Self {
        Self { stock }
    }
}

impl Default for StaticInventoryProvider {
    fn default() -> Self {
        let stock = BTreeMap::from([
            ("Water Filters (units)".to_string(), 200),
            ("Medical Kits (Level 2)".to_string(), 50),
            ("Ready-to-Eat Meals (kits)".to_string(), 5_000),
            ("Tents (family size)".to_string(), 150),
            ("Fuel (liters)".to_string(), 10_000),
            ("Heavy Machinery (bulldozers/excavators)".to_string(), 2),
        ]);
        Self { stock }
    }
}

#[async_trait]
impl InventoryProvider for StaticInventoryProvider {
    async fn snapshot(&self) -> Result<InventorySnapshot, EngineError> {
        Ok(InventorySnapshot {
            taken_at: Utc::now(),
            stock: self.stock.clone(),
        })
    }
}
