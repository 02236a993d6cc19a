//! Database credential acquisition and rotation.
//!
//! Sessions never fetch credentials themselves. A single refresher task
//! fetches from a [`CredentialSource`] on a fixed cadence and publishes the
//! latest credentials on a watch channel; every session reads from that
//! channel at connect time.

mod provider;
mod refresher;
mod types;

pub use provider::{CommandSource, CredentialSource, StaticSource};
pub use refresher::{CredentialRefresher, CredentialsRx, RefresherHandle};
pub use types::DbCredentials;
