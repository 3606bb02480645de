use core::str::FromStr;

use serde::{Deserialize, Serialize};

use loopforge_core::DomainError;

/// One of the six lifecycle states of a card's current cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Triggered,
    Ordered,
    InTransit,
    Received,
    Restocked,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Created,
        Stage::Triggered,
        Stage::Ordered,
        Stage::InTransit,
        Stage::Received,
        Stage::Restocked,
    ];

    /// Stages reachable from `self` in one step.
    pub fn allowed_next(self) -> &'static [Stage] {
        match self {
            Stage::Created => &[Stage::Triggered],
            Stage::Triggered => &[Stage::Ordered],
            Stage::Ordered => &[Stage::InTransit, Stage::Received],
            Stage::InTransit => &[Stage::Received],
            Stage::Received => &[Stage::Restocked],
            Stage::Restocked => &[Stage::Created],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Triggered => "triggered",
            Stage::Ordered => "ordered",
            Stage::InTransit => "in_transit",
            Stage::Received => "received",
            Stage::Restocked => "restocked",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown stage '{s}'")))
    }
}

/// `true` iff `to` is a direct successor of `from` in the fixed matrix.
pub fn is_valid_transition(from: Stage, to: Stage) -> bool {
    from.allowed_next().contains(&to)
}

/// Kind of replenishment circuit a card belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Procurement,
    Production,
    Transfer,
}

impl LoopType {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopType::Procurement => "procurement",
            LoopType::Production => "production",
            LoopType::Transfer => "transfer",
        }
    }
}

impl core::fmt::Display for LoopType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "procurement" => Ok(LoopType::Procurement),
            "production" => Ok(LoopType::Production),
            "transfer" => Ok(LoopType::Transfer),
            other => Err(DomainError::validation(format!("unknown loop type '{other}'"))),
        }
    }
}

/// How a transition was initiated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionMethod {
    QrScan,
    Manual,
    System,
}

impl TransitionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionMethod::QrScan => "qr_scan",
            TransitionMethod::Manual => "manual",
            TransitionMethod::System => "system",
        }
    }
}

impl core::fmt::Display for TransitionMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qr_scan" => Ok(TransitionMethod::QrScan),
            "manual" => Ok(TransitionMethod::Manual),
            "system" => Ok(TransitionMethod::System),
            other => Err(DomainError::validation(format!("unknown transition method '{other}'"))),
        }
    }
}
