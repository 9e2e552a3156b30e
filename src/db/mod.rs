//! SQLite persistence: schema migrations, typed rows and the repository
//! functions the sync engine works against.

pub mod model;
pub mod repo;

pub use model::{
    ActionKey, ActionMutation, ActionRow, CreditStatus, GroupMenuEntry, LogData, MenuEntry,
    MenuSlot,
};
pub use repo::Pool;
