use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Estados del ciclo de vida de una unidad de trabajo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOfWorkState {
    Created,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl UnitOfWorkState {
    /// Valida si una transición de estado es válida
    ///
    /// Transiciones válidas:
    /// - Created → Active, RollingBack
    /// - Active → Committing, RollingBack
    /// - Committing → Committed, RollingBack
    /// - RollingBack → RolledBack
    /// - cualquier estado no terminal → Failed
    /// - Committed, RolledBack, Failed → (terminal)
    pub fn can_transition_to(&self, new_state: &UnitOfWorkState) -> bool {
        match (self, new_state) {
            (s, n) if s == n => false,
            (s, _) if s.is_terminal() => false,

            (UnitOfWorkState::Created, UnitOfWorkState::Active) => true,
            (UnitOfWorkState::Created, UnitOfWorkState::RollingBack) => true,

            (UnitOfWorkState::Active, UnitOfWorkState::Committing) => true,
            (UnitOfWorkState::Active, UnitOfWorkState::RollingBack) => true,

            // A failed commit statement rolls the whole transaction back
            (UnitOfWorkState::Committing, UnitOfWorkState::Committed) => true,
            (UnitOfWorkState::Committing, UnitOfWorkState::RollingBack) => true,

            (UnitOfWorkState::RollingBack, UnitOfWorkState::RolledBack) => true,

            (_, UnitOfWorkState::Failed) => true,

            _ => false,
        }
    }

    /// Retorna true si el estado es terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitOfWorkState::Committed | UnitOfWorkState::RolledBack | UnitOfWorkState::Failed
        )
    }

    /// Retorna true si la unidad todavía tiene una transacción abierta
    pub fn holds_transaction(&self) -> bool {
        matches!(
            self,
            UnitOfWorkState::Active | UnitOfWorkState::Committing | UnitOfWorkState::RollingBack
        )
    }
}

impl fmt::Display for UnitOfWorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWorkState::Created => write!(f, "created"),
            UnitOfWorkState::Active => write!(f, "active"),
            UnitOfWorkState::Committing => write!(f, "committing"),
            UnitOfWorkState::Committed => write!(f, "committed"),
            UnitOfWorkState::RollingBack => write!(f, "rolling_back"),
            UnitOfWorkState::RolledBack => write!(f, "rolled_back"),
            UnitOfWorkState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for UnitOfWorkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(UnitOfWorkState::Created),
            "active" => Ok(UnitOfWorkState::Active),
            "committing" => Ok(UnitOfWorkState::Committing),
            "committed" => Ok(UnitOfWorkState::Committed),
            "rolling_back" => Ok(UnitOfWorkState::RollingBack),
            "rolled_back" => Ok(UnitOfWorkState::RolledBack),
            "failed" => Ok(UnitOfWorkState::Failed),
            _ => Err(format!("Invalid UnitOfWorkState: {}", s)),
        }
    }
}

/// Política ante una clave de idempotencia en curso
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Wait (bounded) for the concurrent owner to finish
    Wait,
    /// Fail immediately with `IdempotencyInFlight`
    Fail,
}

impl Default for InFlightPolicy {
    fn default() -> Self {
        InFlightPolicy::Wait
    }
}

impl fmt::Display for InFlightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InFlightPolicy::Wait => write!(f, "wait"),
            InFlightPolicy::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for InFlightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(InFlightPolicy::Wait),
            "fail" => Ok(InFlightPolicy::Fail),
            _ => Err(format!("Invalid InFlightPolicy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(UnitOfWorkState::Created, UnitOfWorkState::Active, true)]
    #[case(UnitOfWorkState::Active, UnitOfWorkState::Committing, true)]
    #[case(UnitOfWorkState::Active, UnitOfWorkState::RollingBack, true)]
    #[case(UnitOfWorkState::Committing, UnitOfWorkState::Committed, true)]
    #[case(UnitOfWorkState::Committing, UnitOfWorkState::RollingBack, true)]
    #[case(UnitOfWorkState::RollingBack, UnitOfWorkState::RolledBack, true)]
    #[case(UnitOfWorkState::Active, UnitOfWorkState::Failed, true)]
    #[case(UnitOfWorkState::Created, UnitOfWorkState::Committing, false)]
    #[case(UnitOfWorkState::Committed, UnitOfWorkState::RollingBack, false)]
    #[case(UnitOfWorkState::RolledBack, UnitOfWorkState::Active, false)]
    #[case(UnitOfWorkState::Failed, UnitOfWorkState::Failed, false)]
    #[case(UnitOfWorkState::Committed, UnitOfWorkState::Failed, false)]
    fn test_unit_of_work_transitions(
        #[case] from: UnitOfWorkState,
        #[case] to: UnitOfWorkState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(&to), allowed);
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            UnitOfWorkState::Created,
            UnitOfWorkState::Active,
            UnitOfWorkState::Committing,
            UnitOfWorkState::Committed,
            UnitOfWorkState::RollingBack,
            UnitOfWorkState::RolledBack,
            UnitOfWorkState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<UnitOfWorkState>(), Ok(state));
        }
    }

    #[test]
    fn test_in_flight_policy_parse() {
        assert_eq!("WAIT".parse::<InFlightPolicy>(), Ok(InFlightPolicy::Wait));
        assert_eq!("fail".parse::<InFlightPolicy>(), Ok(InFlightPolicy::Fail));
        assert!("block".parse::<InFlightPolicy>().is_err());
    }
}
