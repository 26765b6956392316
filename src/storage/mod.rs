pub mod codec;
pub mod kv;
pub mod oracle;
pub mod txn;

pub use kv::{KvStore, MemKvStore, Mutation};
pub use oracle::{LocalOracle, Timestamp, TimestampOracle};
pub use txn::{RetryPolicy, Transaction, run_in_new_txn};
