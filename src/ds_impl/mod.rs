pub mod concurrent_set;

pub mod hp;
pub mod lock;

pub use self::concurrent_set::{ConcurrentSet, Key};
pub use self::hp::FRList;
pub use self::lock::LockList;
