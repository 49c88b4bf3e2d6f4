pub mod indexer;
pub mod q_table;
pub mod table;

pub use indexer::{ActionIndexer, Identity, StateIndexer};
pub use q_table::{GreedyRun, QLearner, QLearnerConfig, TrainReport};
pub use table::{QTable, TableInit};
