//! Lot lifecycle as a closed state machine.

use serde::{Deserialize, Serialize};

use lotsync_core::DomainError;

/// Lifecycle status of a separation lot row.
///
/// Declaration order is lifecycle order, so `Ord` means "less/more advanced".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    /// Planner-visible draft; not a shipping commitment yet.
    Preview,
    /// Confirmed by the planner; quantities locked for quoting.
    Open,
    /// A carrier price is attached. Changes past this point raise alerts.
    Quoted,
    /// Cargo left the warehouse.
    Shipped,
    /// Terminal; immutable history.
    Invoiced,
}

/// Coarse grouping the reconciliation engine works with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LotPhase {
    /// PREVIEW / OPEN: nothing promised to a customer; safe to cut or delete.
    PreQuote,
    /// QUOTED / SHIPPED: cuts must raise alerts; never deleted automatically.
    Committed,
    /// INVOICED: never touched.
    Closed,
}

impl LotStatus {
    pub const ALL: [LotStatus; 5] = [
        LotStatus::Preview,
        LotStatus::Open,
        LotStatus::Quoted,
        LotStatus::Shipped,
        LotStatus::Invoiced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Preview => "PREVIEW",
            LotStatus::Open => "OPEN",
            LotStatus::Quoted => "QUOTED",
            LotStatus::Shipped => "SHIPPED",
            LotStatus::Invoiced => "INVOICED",
        }
    }

    pub fn phase(&self) -> LotPhase {
        match self {
            LotStatus::Preview | LotStatus::Open => LotPhase::PreQuote,
            LotStatus::Quoted | LotStatus::Shipped => LotPhase::Committed,
            LotStatus::Invoiced => LotPhase::Closed,
        }
    }

    /// The single status this one may advance to.
    pub fn next(&self) -> Option<LotStatus> {
        match self {
            LotStatus::Preview => Some(LotStatus::Open),
            LotStatus::Open => Some(LotStatus::Quoted),
            LotStatus::Quoted => Some(LotStatus::Shipped),
            LotStatus::Shipped => Some(LotStatus::Invoiced),
            LotStatus::Invoiced => None,
        }
    }

    pub fn can_advance_to(&self, to: LotStatus) -> bool {
        self.next() == Some(to)
    }

    /// Validate a `from -> to` request.
    pub fn check_transition(from: LotStatus, to: LotStatus) -> Result<(), DomainError> {
        if from.can_advance_to(to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(from, to))
        }
    }

    /// Parse a status string, including the legacy Portuguese spellings found in
    /// older rows. Returns the status plus the returned-to-yard side flag.
    pub fn parse_legacy(raw: &str) -> Result<(LotStatus, bool), DomainError> {
        let normalized = raw.trim().to_ascii_uppercase();
        let parsed = match normalized.as_str() {
            "PREVIEW" | "PREVISAO" => (LotStatus::Preview, false),
            "OPEN" | "ABERTO" => (LotStatus::Open, false),
            "QUOTED" | "COTADO" => (LotStatus::Quoted, false),
            "SHIPPED" | "EMBARCADO" => (LotStatus::Shipped, false),
            "INVOICED" | "FATURADO" => (LotStatus::Invoiced, false),
            "RETURNED_TO_YARD" | "NF NO CD" | "NF_CD" => (LotStatus::Shipped, true),
            _ => {
                return Err(DomainError::validation(format!(
                    "unknown lot status '{}'",
                    raw.trim()
                )));
            }
        };
        Ok(parsed)
    }
}

impl core::fmt::Display for LotStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for LotStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match LotStatus::parse_legacy(s)? {
            (status, false) => Ok(status),
            (_, true) => Err(DomainError::validation(
                "RETURNED_TO_YARD is a flag, not a status",
            )),
        }
    }
}
