//! Table-driven finite-state machine used by every operation.
//!
//! The transition table is an explicit list of `(event, from, to)` rows,
//! validated for ambiguity at construction. A `None` from-state is a
//! wildcard matching any state; an exact row always wins over a wildcard.
//! Firing an event with no matching row is a contract violation and leaves
//! the state unchanged.
//!
//! On-enter behavior lives in each operation's driver loop, which matches
//! on the state returned by [`StateMachine::fire`].

use std::fmt::Debug;

use super::error::ContractError;

/// One row of a transition table: `(event, from-state or wildcard, to-state)`.
pub type Transition<S, E> = (E, Option<S>, S);

/// An explicit finite-state machine with a validated transition table.
#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    transitions: Vec<Transition<S, E>>,
    terminal: Vec<S>,
    current: S,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + PartialEq + Debug,
    E: Copy + PartialEq + Debug,
{
    /// Build a machine from its initial state, terminal states, and
    /// transition table. Fails fast if the table declares the same
    /// `(event, from)` pair twice (wildcards included).
    pub fn new(
        initial: S,
        terminal: &[S],
        transitions: &[Transition<S, E>],
    ) -> Result<Self, ContractError> {
        for (i, (event, from, _)) in transitions.iter().enumerate() {
            for (other_event, other_from, _) in &transitions[i + 1..] {
                if event == other_event && from == other_from {
                    return Err(ContractError::DuplicateTransition {
                        event: format!("{event:?}"),
                        state: from.map_or_else(|| "*".to_string(), |s| format!("{s:?}")),
                    });
                }
            }
        }
        Ok(Self {
            transitions: transitions.to_vec(),
            terminal: terminal.to_vec(),
            current: initial,
        })
    }

    /// The machine's current state.
    pub fn current(&self) -> S {
        self.current
    }

    /// True once the current state is terminal.
    pub fn is_finished(&self) -> bool {
        self.terminal.contains(&self.current)
    }

    /// Fire an event: look up the transition for `(event, current)`,
    /// preferring an exact row over a wildcard, and enter the target state.
    ///
    /// Returns the newly-entered state, or
    /// [`ContractError::IllegalTransition`] (state unchanged) when the
    /// event is not defined for the current state.
    pub fn fire(&mut self, event: E) -> Result<S, ContractError> {
        let exact = self
            .transitions
            .iter()
            .find(|(e, from, _)| *e == event && *from == Some(self.current));
        let row = exact.or_else(|| {
            self.transitions
                .iter()
                .find(|(e, from, _)| *e == event && from.is_none())
        });
        match row {
            Some((_, _, to)) => {
                tracing::trace!(?event, from = ?self.current, to = ?to, "transition");
                self.current = *to;
                Ok(*to)
            }
            None => Err(ContractError::IllegalTransition {
                event: format!("{event:?}"),
                state: format!("{:?}", self.current),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum S {
        Idle,
        Busy,
        Broken,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum E {
        Start,
        Finish,
        Explode,
        Reset,
    }

    fn machine() -> StateMachine<S, E> {
        StateMachine::new(
            S::Idle,
            &[S::Done],
            &[
                (E::Start, Some(S::Idle), S::Busy),
                (E::Finish, Some(S::Busy), S::Done),
                (E::Explode, None, S::Broken),
                (E::Reset, Some(S::Broken), S::Idle),
            ],
        )
        .unwrap()
    }

    #[test]
    fn walks_declared_transitions() {
        let mut m = machine();
        assert_eq!(m.fire(E::Start).unwrap(), S::Busy);
        assert!(!m.is_finished());
        assert_eq!(m.fire(E::Finish).unwrap(), S::Done);
        assert!(m.is_finished());
    }

    #[test]
    fn illegal_event_fails_and_leaves_state_unchanged() {
        let mut m = machine();
        let err = m.fire(E::Finish).unwrap_err();
        assert!(matches!(err, ContractError::IllegalTransition { .. }));
        assert_eq!(m.current(), S::Idle);
    }

    #[test]
    fn wildcard_matches_from_any_state() {
        let mut m = machine();
        m.fire(E::Start).unwrap();
        assert_eq!(m.fire(E::Explode).unwrap(), S::Broken);
        assert_eq!(m.fire(E::Reset).unwrap(), S::Idle);
    }

    #[test]
    fn exact_row_wins_over_wildcard() {
        let mut m = StateMachine::new(
            S::Idle,
            &[S::Done],
            &[
                (E::Explode, Some(S::Idle), S::Done),
                (E::Explode, None, S::Broken),
            ],
        )
        .unwrap();
        assert_eq!(m.fire(E::Explode).unwrap(), S::Done);
    }

    #[test]
    fn duplicate_rows_are_rejected_at_construction() {
        let err = StateMachine::new(
            S::Idle,
            &[S::Done],
            &[
                (E::Start, Some(S::Idle), S::Busy),
                (E::Start, Some(S::Idle), S::Done),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::DuplicateTransition { .. }));
    }

    #[test]
    fn duplicate_wildcards_are_rejected() {
        let err = StateMachine::new(
            S::Idle,
            &[S::Done],
            &[(E::Explode, None, S::Broken), (E::Explode, None, S::Done)],
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::DuplicateTransition { .. }));
    }
}
