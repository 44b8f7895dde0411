pub mod db;
pub mod locks;

pub use db::{SequencePair, StoreDb};
pub use locks::KeyedLocks;
