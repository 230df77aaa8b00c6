//! drydock-source — fetches app source trees for building.
//!
//! A `GitFetcher` keeps one clone per app under a base directory. The
//! first sync clones; later syncs fetch and hard-reset to the remote
//! branch head, so disk and network cost stay bounded and a sync with no
//! upstream change is a no-op that resolves the same commit.

pub mod fetcher;

pub use fetcher::{Checkout, GitFetcher, SourceError, SourceFetcher, SourceResult};
