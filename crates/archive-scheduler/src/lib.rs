//! Account registry and least-busy scheduler (spec §4.F). Owns every active
//! account's REST client, gateway session, and in-flight operations, and
//! answers "which account should take this next unit of work."

mod account;
mod registry;

pub use account::{Account, AccountId, ReferenceSide, RunningOperation, ThreadVariant};
pub use archive_types::{ChannelId, GuildId};
pub use registry::{AccountRegistry, RegisterOptions};
