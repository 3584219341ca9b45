//! Producers that react to time and to backend changes. They only ever
//! enqueue commands.

mod changes;
mod ticker;

pub use changes::ChangeListener;
pub use ticker::{TickOutcome, Ticker};
