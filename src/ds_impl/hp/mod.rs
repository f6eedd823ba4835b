mod pointers;

pub mod list;

pub use self::list::{FRList, Handle, List, Mode};
