/// Maps a raw observation to a row of the Q-table
///
/// Must be deterministic and pure: the same observation always maps to the same
/// index within one run. Different observations may share an index.
pub trait StateIndexer<O: ?Sized> {
    fn index(&self, observation: &O) -> usize;
}

impl<O: ?Sized, F> StateIndexer<O> for F
where
    F: Fn(&O) -> usize,
{
    fn index(&self, observation: &O) -> usize {
        self(observation)
    }
}

/// Maps an environment action index to a column of the Q-table
pub trait ActionIndexer {
    fn index(&self, action: usize) -> usize;
}

impl<F> ActionIndexer for F
where
    F: Fn(usize) -> usize,
{
    fn index(&self, action: usize) -> usize {
        self(action)
    }
}

/// Uses the value itself as the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity;

impl ActionIndexer for Identity {
    fn index(&self, action: usize) -> usize {
        action
    }
}

impl StateIndexer<usize> for Identity {
    fn index(&self, observation: &usize) -> usize {
        *observation
    }
}
