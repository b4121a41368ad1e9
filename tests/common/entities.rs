use persistence_context::User;

/// A user whose unique fields are derived from `tag`.
pub fn sample_user(tag: &str) -> User {
    User::new(
        format!("user_{tag}"),
        "hashed-secret",
        format!("{tag}@example.com"),
        format!("1380013{:04}", tag_number(tag)),
    )
}

fn tag_number(tag: &str) -> u32 {
    tag.bytes()
        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
        % 10_000
}
