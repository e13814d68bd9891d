pub mod cryptor;
pub mod redaction;
pub mod tokens;

pub use cryptor::{Cryptor, SealedBody};
pub use redaction::{RedactingWriter, redact_secrets};
pub use tokens::{INVITE_CODE_LEN, SALT_LEN, generate_invite_code, generate_salt};
