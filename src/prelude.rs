pub use crate::base::{
    config::Config,
    types::{Err, HistoryEntry, HistoryRole, Message, Res, Void},
};
pub use anyhow::anyhow;
pub use tracing::{debug, error, info, instrument, warn};
