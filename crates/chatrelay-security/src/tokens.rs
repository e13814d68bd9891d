use rand::Rng;
use rand::distr::Alphanumeric;

/// Length of the per-user key-derivation salt.
pub const SALT_LEN: usize = 32;
/// Invite codes are zero-padded decimal numbers of this many digits.
pub const INVITE_CODE_LEN: usize = 8;

const INVITE_CODE_SPACE: u32 = 100_000_000;

/// Random base62 string used as a user's key-derivation salt.
pub fn generate_salt() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect()
}

pub fn generate_invite_code() -> String {
    let n = rand::rng().random_range(0..INVITE_CODE_SPACE);
    format!("{n:0width$}", width = INVITE_CODE_LEN)
}
