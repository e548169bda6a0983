//! FreeTun Common Types
//!
//! Shared types of the FreeTun escrow core: identifiers, money, the
//! project/proposal/escrow entities with their status machines, and the
//! error taxonomy every component reports through.

pub mod identifiers;
pub mod monetary;
pub mod actor;
pub mod project;
pub mod proposal;
pub mod escrow;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use actor::*;
pub use project::*;
pub use proposal::*;
pub use escrow::*;
pub use error::*;
pub use time::*;
