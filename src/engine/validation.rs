/// Longest accepted username (matches the `users.username` column budget).
pub const MAX_USERNAME_LEN: usize = 50;

/// Longest accepted group name.
pub const MAX_GROUP_NAME_LEN: usize = 100;

/// Default cap on message text, in bytes.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

pub const MIN_PASSWORD_LEN: usize = 4;

pub fn validate_username(username: &str) -> Result<(), String> {
    validate_name(username, "Username", MAX_USERNAME_LEN)
}

pub fn validate_group_name(group: &str) -> Result<(), String> {
    validate_name(group, "Group name", MAX_GROUP_NAME_LEN)
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(())
}

fn validate_name(name: &str, what: &str, max_len: usize) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{} cannot be empty", what));
    }
    if name.chars().count() > max_len {
        return Err(format!("{} cannot exceed {} characters", what, max_len));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("{} contains invalid character {:?}", what, c));
    }
    Ok(())
}
