use std::sync::{Arc, RwLock};

use crate::error::GroveError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, GroveError>;

pub type GroveResult<T = ()> = Result<T, GroveError>;

pub fn pod<T>(t: T) -> Pod<T> {
    Arc::new(RwLock::new(t))
}
