mod changeset;
mod log_manager;

pub use changeset::Changeset;
pub use log_manager::{LogManager, LOG_HEADER_SIZE};
