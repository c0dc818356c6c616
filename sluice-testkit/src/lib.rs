//! Test doubles for sluice.
//!
//! Content drives behaviour: the mock fetcher returns the fetch key itself as
//! the document body unless told otherwise, and [`MockProcessor`] reacts to
//! magic bodies such as `crash`, `hang` or `exception`. A work item built with
//! [`work_item`] therefore describes its own fate.

mod extension;
mod items;
mod mock;
mod state;

pub use extension::*;
pub use items::*;
pub use mock::*;
pub use state::*;
