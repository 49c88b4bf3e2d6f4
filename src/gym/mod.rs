pub mod square_world;

pub use square_world::{Location, SquareWorld};
