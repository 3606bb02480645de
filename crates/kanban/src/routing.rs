use crate::stage::LoopType;

/// Downstream queue a freshly triggered card is routed to. Depends only on the loop type.
pub fn queue_for_loop(loop_type: LoopType) -> &'static str {
    match loop_type {
        LoopType::Procurement => "Order Queue",
        LoopType::Production => "Production Queue",
        LoopType::Transfer => "Transfer Queue",
    }
}
