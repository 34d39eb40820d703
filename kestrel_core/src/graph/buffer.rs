// kestrel_core/src/graph/buffer.rs

use std::collections::BTreeMap;

use crate::error::{Result, SlamError};
use crate::graph::factors::Factor;
use crate::types::{Key, Variable};

/// Factors and initial guesses accumulated since the last successful solve.
///
/// The buffer is handed to the solver as a whole and cleared only once the
/// solve succeeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingUpdateBuffer {
    factors: Vec<Factor>,
    initial_values: BTreeMap<Key, Variable>,
}

impl PendingUpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn initial_values(&self) -> &BTreeMap<Key, Variable> {
        &self.initial_values
    }

    pub fn has_initial(&self, key: Key) -> bool {
        self.initial_values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty() && self.initial_values.is_empty()
    }

    pub(crate) fn push_factor(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    /// Records the initial guess for a key that is new to the graph.
    pub(crate) fn insert_initial(&mut self, key: Key, value: Variable) -> Result<()> {
        if self.initial_values.contains_key(&key) {
            return Err(SlamError::invalid_state(format!(
                "initial value for {} is already pending",
                key
            )));
        }
        self.initial_values.insert(key, value);
        Ok(())
    }

    /// Drops every pending factor touching `key`, plus its pending initial
    /// value. Returns the number of factors removed.
    pub(crate) fn discard_key(&mut self, key: Key) -> usize {
        let before = self.factors.len();
        self.factors.retain(|f| !f.involves(key));
        self.initial_values.remove(&key);
        before - self.factors.len()
    }

    pub(crate) fn clear(&mut self) {
        self.factors.clear();
        self.initial_values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Vector6};

    fn between(from: Key, to: Key) -> Factor {
        Factor::Between {
            from,
            to,
            measured: Isometry3::identity(),
            sigmas: Vector6::repeat(0.1),
        }
    }

    #[test]
    fn test_duplicate_initial_value_is_refused() {
        let mut buffer = PendingUpdateBuffer::new();
        buffer
            .insert_initial(Key::Pose(1), Variable::Pose(Isometry3::identity()))
            .unwrap();
        let err = buffer
            .insert_initial(Key::Pose(1), Variable::Pose(Isometry3::identity()))
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidState(_)));
    }

    #[test]
    fn test_discard_key_removes_factors_and_guess() {
        let mut buffer = PendingUpdateBuffer::new();
        buffer.push_factor(between(Key::Pose(0), Key::Pose(1)));
        buffer.push_factor(between(Key::Pose(1), Key::Landmark(5)));
        buffer
            .insert_initial(Key::Landmark(5), Variable::Pose(Isometry3::identity()))
            .unwrap();

        assert_eq!(buffer.discard_key(Key::Landmark(5)), 1);
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.has_initial(Key::Landmark(5)));
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut buffer = PendingUpdateBuffer::new();
        buffer.push_factor(between(Key::Pose(0), Key::Pose(1)));
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
