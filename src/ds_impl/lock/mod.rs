pub mod list;

pub use self::list::LockList;
