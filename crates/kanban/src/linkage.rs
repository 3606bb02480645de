//! Order linkage required by some transitions.
//!
//! Linkage is trusted as supplied by the caller; the referenced order is not looked up.

use serde::{Deserialize, Serialize};

use crate::stage::{LoopType, Stage};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    PurchaseOrder,
    WorkOrder,
    TransferOrder,
}

impl OrderKind {
    /// The order a loop of this type is fulfilled by.
    pub fn for_loop(loop_type: LoopType) -> Self {
        match loop_type {
            LoopType::Procurement => OrderKind::PurchaseOrder,
            LoopType::Production => OrderKind::WorkOrder,
            LoopType::Transfer => OrderKind::TransferOrder,
        }
    }

    /// Key the order id is supplied under in transition metadata.
    pub fn metadata_key(self) -> &'static str {
        match self {
            OrderKind::PurchaseOrder => "purchaseOrderId",
            OrderKind::WorkOrder => "workOrderId",
            OrderKind::TransferOrder => "transferOrderId",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::PurchaseOrder => "purchase_order",
            OrderKind::WorkOrder => "work_order",
            OrderKind::TransferOrder => "transfer_order",
        }
    }
}

impl core::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete order reference extracted from metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLink {
    pub kind: OrderKind,
    pub order_id: String,
}

/// Order kind the `(from, to)` pair requires for a loop of `loop_type`, if any.
pub fn required_linkage(from: Stage, to: Stage, loop_type: LoopType) -> Option<OrderKind> {
    match (from, to) {
        (Stage::Triggered, Stage::Ordered) => Some(OrderKind::for_loop(loop_type)),
        _ => None,
    }
}

/// Pull the order id for `kind` out of transition metadata.
///
/// Only non-empty strings count.
pub fn extract_link(kind: OrderKind, metadata: &serde_json::Value) -> Option<OrderLink> {
    metadata
        .get(kind.metadata_key())
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|order_id| OrderLink {
            kind,
            order_id: order_id.to_string(),
        })
}
