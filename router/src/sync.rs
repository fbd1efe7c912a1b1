pub mod locking;

pub use locking::{InstanceLock, LockError};
