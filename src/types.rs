// =============================================================================
// Shared types used across the Spotmind trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side — used when closing a position.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Exchange wire representation ("BUY" / "SELL").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LIMIT" => Some(Self::Limit),
            "MARKET" => Some(Self::Market),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange order lifecycle. FILLED, CANCELLED and REJECTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses are absorbing: no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELLED" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Map a Binance order status string onto our lifecycle.
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::Pending),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" | "EXPIRED" | "PENDING_CANCEL" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a generated signal asks the execution layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    CloseLong,
    CloseShort,
}

impl SignalAction {
    /// Map the signal action onto the exchange order side.
    /// Closing a short means buying back; closing a long means selling.
    pub fn order_side(self) -> Option<Side> {
        match self {
            Self::Buy | Self::CloseShort => Some(Side::Buy),
            Self::Sell | Self::CloseLong => Some(Side::Sell),
            Self::Hold => None,
        }
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::CloseLong => "CLOSE_LONG",
            Self::CloseShort => "CLOSE_SHORT",
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// System-wide trading status kept in the risk state and the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Active,
    Paused,
    EmergencyStop,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SystemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "EMERGENCY_STOP" => Some(Self::EmergencyStop),
            _ => None,
        }
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_roundtrip() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite().opposite(), Side::Sell);
    }

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn exchange_status_mapping() {
        assert_eq!(OrderStatus::from_exchange("NEW"), Some(OrderStatus::Pending));
        assert_eq!(
            OrderStatus::from_exchange("CANCELED"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(OrderStatus::from_exchange("???"), None);
    }

    #[test]
    fn action_to_order_side() {
        assert_eq!(SignalAction::Buy.order_side(), Some(Side::Buy));
        assert_eq!(SignalAction::CloseShort.order_side(), Some(Side::Buy));
        assert_eq!(SignalAction::Sell.order_side(), Some(Side::Sell));
        assert_eq!(SignalAction::CloseLong.order_side(), Some(Side::Sell));
        assert_eq!(SignalAction::Hold.order_side(), None);
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            SystemStatus::Active,
            SystemStatus::Paused,
            SystemStatus::EmergencyStop,
        ] {
            assert_eq!(SystemStatus::parse(s.as_str()), Some(s));
        }
    }
}
