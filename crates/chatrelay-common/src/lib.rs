pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use model::{
    InputState, MessageVersion, NewMessage, NewUser, Role, StoredMessage, UsageRecord, User,
};
pub use types::{ChatId, UpdateId};
